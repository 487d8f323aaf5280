//! Delimiter set declared by a message header.

use crate::{Hl7Error, Hl7Result};
use serde::Serialize;
use std::borrow::Cow;

/// Line ending used between segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentTerminator {
    /// `\r`, the terminator the legacy standard prescribes.
    Cr,
    /// `\n`, common in files written by hand or by scripts.
    Lf,
    /// `\r\n`.
    CrLf,
}

impl SegmentTerminator {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentTerminator::Cr => "\r",
            SegmentTerminator::Lf => "\n",
            SegmentTerminator::CrLf => "\r\n",
        }
    }

    /// Detects the terminator from the first line break in `text`.
    ///
    /// Text without any line break is a single segment; `Cr` is reported in that case.
    pub(crate) fn detect(text: &str) -> Self {
        match text.find(['\r', '\n']) {
            Some(idx) if text[idx..].starts_with("\r\n") => SegmentTerminator::CrLf,
            Some(idx) if text.as_bytes()[idx] == b'\n' => SegmentTerminator::Lf,
            _ => SegmentTerminator::Cr,
        }
    }
}

/// The separator characters of one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
    pub segment_terminator: SegmentTerminator,
}

impl Delimiters {
    /// Builds a delimiter set from the field separator and the MSH-2 encoding characters.
    ///
    /// MSH-2 must declare exactly four characters in the order component, repetition, escape,
    /// subcomponent. Every delimiter must be distinct, must not be alphanumeric or whitespace,
    /// and must not be a line break.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::MalformedMessage`] when a delimiter is missing, duplicated, or unusable.
    pub fn from_header(
        field: char,
        encoding_characters: &str,
        segment_terminator: SegmentTerminator,
    ) -> Hl7Result<Self> {
        let chars: Vec<char> = encoding_characters.chars().collect();
        if chars.len() != 4 {
            return Err(Hl7Error::MalformedMessage(format!(
                "MSH-2 must declare exactly 4 encoding characters, found {:?}",
                encoding_characters
            )));
        }

        let all = [field, chars[0], chars[1], chars[2], chars[3]];
        for (idx, c) in all.iter().enumerate() {
            if c.is_alphanumeric() || c.is_whitespace() {
                return Err(Hl7Error::MalformedMessage(format!(
                    "delimiter {c:?} must not be alphanumeric or whitespace"
                )));
            }
            if all[..idx].contains(c) {
                return Err(Hl7Error::MalformedMessage(format!(
                    "delimiter {c:?} is declared more than once"
                )));
            }
        }

        Ok(Self {
            field,
            component: chars[0],
            repetition: chars[1],
            escape: chars[2],
            subcomponent: chars[3],
            segment_terminator,
        })
    }

    /// The MSH-2 text these delimiters were declared with.
    pub fn encoding_characters(&self) -> String {
        [
            self.component,
            self.repetition,
            self.escape,
            self.subcomponent,
        ]
        .iter()
        .collect()
    }

    /// Decodes escape sequences in a text value.
    ///
    /// Supported sequences: `\F\` field, `\S\` component, `\T\` subcomponent,
    /// `\R\` repetition and `\E\` escape (shown with the default escape character). Unknown or
    /// unterminated sequences are kept verbatim.
    pub fn unescape<'a>(&self, raw: &'a str) -> Cow<'a, str> {
        if !raw.contains(self.escape) {
            return Cow::Borrowed(raw);
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find(self.escape) {
            out.push_str(&rest[..start]);
            let after = &rest[start + self.escape.len_utf8()..];
            let Some(end) = after.find(self.escape) else {
                out.push_str(&rest[start..]);
                return Cow::Owned(out);
            };

            let decoded = match &after[..end] {
                "F" => Some(self.field),
                "S" => Some(self.component),
                "T" => Some(self.subcomponent),
                "R" => Some(self.repetition),
                "E" => Some(self.escape),
                _ => None,
            };
            match decoded {
                Some(c) => out.push(c),
                None => {
                    out.push(self.escape);
                    out.push_str(&after[..end]);
                    out.push(self.escape);
                }
            }
            rest = &after[end + self.escape.len_utf8()..];
        }
        out.push_str(rest);
        Cow::Owned(out)
    }
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
            segment_terminator: SegmentTerminator::Cr,
        }
    }
}
