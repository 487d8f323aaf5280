//! Text → [`Message`] parsing.

use crate::tree::{Component, Field, Message, Repetition, Segment};
use crate::{Delimiters, Hl7Error, Hl7Result, SegmentTerminator, HEADER_TAG};

/// Parses raw message text.
///
/// The delimiters are taken from the message's own `MSH` header. Segment order is preserved,
/// unknown segment tags are retained, and empty fields stay in place as empty strings so that
/// positional addressing is stable. Blank lines between segments are skipped.
///
/// # Errors
///
/// Returns [`Hl7Error::MalformedMessage`] if:
/// - the text contains no segments,
/// - the first segment is not an `MSH` header,
/// - a declared delimiter is missing, duplicated or unusable,
/// - a segment tag is not three upper-case ASCII letters or digits.
///
/// Structurally valid but semantically wrong content (a non-numeric value where a number is
/// expected, an unknown code) is not an error here.
pub fn parse(text: &str) -> Hl7Result<Message> {
    let terminator = SegmentTerminator::detect(text);
    let separator = terminator.as_str();

    let trailing_terminator = text.ends_with(separator) && !text.trim().is_empty();
    let body = text.strip_suffix(separator).unwrap_or(text);
    let lines: Vec<&str> = body.split(separator).filter(|l| !l.is_empty()).collect();

    let Some(header_line) = lines.first() else {
        return Err(Hl7Error::MalformedMessage(
            "message contains zero segments".into(),
        ));
    };
    let delimiters = read_header_delimiters(header_line, terminator)?;

    let mut segments = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let segment = parse_segment(line, &delimiters)
            .map_err(|reason| Hl7Error::MalformedMessage(format!("segment {}: {reason}", idx + 1)))?;
        if idx > 0 && segment.is_header() {
            return Err(Hl7Error::MalformedMessage(format!(
                "segment {}: only one MSH header is allowed",
                idx + 1
            )));
        }
        segments.push(segment);
    }

    Ok(Message::new(delimiters, segments, trailing_terminator))
}

fn read_header_delimiters(line: &str, terminator: SegmentTerminator) -> Hl7Result<Delimiters> {
    let Some(rest) = line.strip_prefix(HEADER_TAG) else {
        return Err(Hl7Error::MalformedMessage(
            "message header segment (MSH) is missing".into(),
        ));
    };
    let Some(field_separator) = rest.chars().next() else {
        return Err(Hl7Error::MalformedMessage(
            "MSH does not declare a field separator".into(),
        ));
    };
    let after_separator = &rest[field_separator.len_utf8()..];
    let encoding_characters = after_separator
        .split(field_separator)
        .next()
        .unwrap_or_default();

    Delimiters::from_header(field_separator, encoding_characters, terminator)
}

fn parse_segment(line: &str, delimiters: &Delimiters) -> Result<Segment, String> {
    let (tag, rest) = match line.find(delimiters.field) {
        Some(idx) => (&line[..idx], Some(&line[idx + delimiters.field.len_utf8()..])),
        None => (line, None),
    };

    if tag.len() != 3
        || !tag
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        return Err(format!("invalid segment tag {tag:?}"));
    }

    let mut fields = Vec::new();
    let Some(rest) = rest else {
        return Ok(Segment {
            tag: tag.to_owned(),
            fields,
        });
    };

    let mut pieces = rest.split(delimiters.field);
    if tag == HEADER_TAG {
        fields.push(Field::literal(delimiters.field));
        fields.push(Field::literal(pieces.next().unwrap_or_default()));
    }
    fields.extend(pieces.map(|raw| parse_field(raw, delimiters)));

    Ok(Segment {
        tag: tag.to_owned(),
        fields,
    })
}

fn parse_field(raw: &str, delimiters: &Delimiters) -> Field {
    Field::new(
        raw.split(delimiters.repetition)
            .map(|rep| parse_repetition(rep, delimiters))
            .collect(),
    )
}

fn parse_repetition(raw: &str, delimiters: &Delimiters) -> Repetition {
    if !raw.contains(delimiters.component) && !raw.contains(delimiters.subcomponent) {
        return Repetition::Scalar(raw.to_owned());
    }
    Repetition::Composite(
        raw.split(delimiters.component)
            .map(|comp| parse_component(comp, delimiters))
            .collect(),
    )
}

fn parse_component(raw: &str, delimiters: &Delimiters) -> Component {
    if raw.contains(delimiters.subcomponent) {
        Component::Composite(
            raw.split(delimiters.subcomponent)
                .map(str::to_owned)
                .collect(),
        )
    } else {
        Component::Scalar(raw.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORU: &str = "MSH|^~\\&|PAS_LEGACY|NORTH_TRUST|FHIR_RECEIVER|NHS_DATA_LAKE|20240105093000||ORU^R01|482913|P|2.3\n\
PID|1||9434767067^^^NHS||SMITH^John^^^^MR||19800101|M|||LS1 4AP||0113 496 0000\n\
OBR|1|ORD1234|FILL1234|8867-4^HEART RATE^LN|||20240105093000\n\
OBX|1|NM|8867-4^HEART RATE^LN||72|/min||||F";

    #[test]
    fn parses_segments_in_order() {
        let message = parse(ORU).expect("parse");
        let tags: Vec<&str> = message.segments().iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(tags, vec!["MSH", "PID", "OBR", "OBX"]);
        assert_eq!(
            message.delimiters().segment_terminator,
            SegmentTerminator::Lf
        );
        assert!(!message.trailing_terminator());
    }

    #[test]
    fn header_fields_follow_legacy_numbering() {
        let message = parse(ORU).expect("parse");
        let msh = message.header();
        assert_eq!(msh.value(1, 1), Ok("|"));
        assert_eq!(msh.value(2, 1), Ok("^~\\&"));
        assert_eq!(msh.value(3, 1), Ok("PAS_LEGACY"));
        assert_eq!(message.message_type(), ("ORU", "R01"));
        assert_eq!(message.control_id(), Some("482913"));
    }

    #[test]
    fn addresses_fields_components_and_keeps_empty_fields() {
        let message = parse(ORU).expect("parse");
        let pid = message.require("PID").expect("PID present");
        assert_eq!(pid.value(2, 1), Ok(""));
        assert_eq!(pid.value(3, 1), Ok("9434767067"));
        assert_eq!(pid.value(3, 4), Ok("NHS"));
        assert_eq!(pid.value(5, 2), Ok("John"));
        assert_eq!(pid.value(5, 6), Ok("MR"));
        assert_eq!(pid.non_empty(4, 1), None);
        assert_eq!(pid.fields.len(), 13);
    }

    #[test]
    fn lookups_fail_closed() {
        let message = parse(ORU).expect("parse");
        let pid = message.require("PID").expect("PID present");

        let err = pid.value(30, 1).expect_err("field beyond segment");
        assert_eq!(err.to_string(), "PID-30.1 not present in message");

        let err = pid.value(8, 2).expect_err("component of scalar field");
        assert!(matches!(err, Hl7Error::NotFound { location } if location.to_string() == "PID-8.2"));

        assert!(pid.value(0, 1).is_err());
        let err = message.require("PV1").expect_err("no PV1");
        assert_eq!(err.to_string(), "PV1 segment not present in message");
    }

    #[test]
    fn splits_repetitions_and_subcomponents() {
        let text = "MSH|^~\\&|A|B|C|D|20240101||ADT^A01|1|P|2.3\rPID|1||123^^^NHS||DOE^JANE~SMITH^JANE||||||||0113~0114&ext";
        let message = parse(text).expect("parse");
        let pid = message.require("PID").expect("PID");

        let names = pid.field(5).expect("PID-5").repetitions();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].value(1), Some("DOE"));
        assert_eq!(names[1].value(1), Some("SMITH"));

        let phones = pid.field(13).expect("PID-13").repetitions();
        assert_eq!(phones[0], Repetition::Scalar("0113".into()));
        let second = phones[1].component(1).expect("component");
        assert_eq!(second.subcomponent(1), Some("0114"));
        assert_eq!(second.subcomponent(2), Some("ext"));
    }

    #[test]
    fn honours_declared_delimiters() {
        let text = "MSH#$*/%#SRC#FAC#DST#FAC#20240101##ORU$R01#77#P#2.3\rOBX#1#NM#8867-4$HEART RATE$LN##72";
        let message = parse(text).expect("parse");
        assert_eq!(message.message_type(), ("ORU", "R01"));
        let obx = message.require("OBX").expect("OBX");
        assert_eq!(obx.value(3, 1), Ok("8867-4"));
        assert_eq!(obx.value(5, 1), Ok("72"));
        assert_eq!(message.encode(), text);
    }

    #[test]
    fn retains_unknown_segments() {
        let text = "MSH|^~\\&|A|B|C|D|20240101||ADT^A08|9|P|2.3\rZPI|custom|data\rPID|1||123";
        let message = parse(text).expect("parse");
        assert_eq!(message.segments()[1].tag, "ZPI");
        assert_eq!(message.by_tag("ZPI").count(), 1);
    }

    #[test]
    fn round_trips_byte_identical_text() {
        let samples = [
            ORU.to_string(),
            format!("{}\n", ORU),
            ORU.replace('\n', "\r"),
            ORU.replace('\n', "\r\n") + "\r\n",
            "MSH|^~\\&|A||||||ADT^A01|1\rPID|||||A&B^C&&D~~E|".to_string(),
            "MSH|^~\\&\rEVN".to_string(),
        ];
        for text in samples {
            let message = parse(&text).expect("parse");
            assert_eq!(message.encode(), text);
        }
    }

    #[test]
    fn skips_blank_lines_between_segments() {
        let message = parse("MSH|^~\\&|A|B|C|D|1||ADT^A01|5\n\nPID|1").expect("parse");
        assert_eq!(message.segments().len(), 2);
        assert_eq!(message.encode(), "MSH|^~\\&|A|B|C|D|1||ADT^A01|5\nPID|1");
    }

    #[test]
    fn rejects_structurally_malformed_messages() {
        let cases = [
            ("", "zero segments"),
            ("\n\n", "zero segments"),
            ("PID|1||123", "MSH) is missing"),
            ("MSH", "field separator"),
            ("MSH|^~\\|A", "exactly 4"),
            ("MSH||~\\&|A", "exactly 4"),
            ("MSH|^^\\&|A", "more than once"),
            ("MSH|^~\\&|A\rpid|1", "invalid segment tag"),
            ("MSH|^~\\&|A\rPIDX|1", "invalid segment tag"),
            ("MSH|^~\\&|A\rMSH|^~\\&|B", "only one MSH"),
        ];
        for (text, expected) in cases {
            match parse(text) {
                Err(Hl7Error::MalformedMessage(msg)) => {
                    assert!(msg.contains(expected), "{text:?}: {msg}")
                }
                other => panic!("{text:?}: expected MalformedMessage, got {other:?}"),
            }
        }
    }

    #[test]
    fn accepts_non_numeric_values_without_complaint() {
        let text = "MSH|^~\\&|A|B|C|D|1||ORU^R01|5\rOBX|1|NM|8867-4^HEART RATE^LN||fast|/min";
        let message = parse(text).expect("semantic problems are not parse errors");
        assert_eq!(message.require("OBX").expect("OBX").value(5, 1), Ok("fast"));
    }

    #[test]
    fn serialises_tree_for_inspection() {
        let message = parse("MSH|^~\\&|A\rPID|1||123^^^NHS").expect("parse");
        let json = serde_json::to_value(&message).expect("serialise");
        assert_eq!(json["segments"][1]["tag"], "PID");
        assert_eq!(json["segments"][1]["fields"][2][0][0], "123");
    }
}
