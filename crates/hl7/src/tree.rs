//! Tagged-variant tree for a parsed message.
//!
//! Indices are 1-based throughout, matching the legacy convention (`PID-3.1` is the first
//! component of the third field of the `PID` segment). Lookups return `Option` for optional
//! navigation and `Hl7Result` where callers need a lookup to fail closed.

use crate::{Delimiters, Hl7Error, Hl7Result, HEADER_TAG};
use serde::Serialize;
use std::fmt;

/// Address of a value inside a message, used for lookups and error reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Location {
    pub segment: String,
    pub field: usize,
    pub component: Option<usize>,
}

impl Location {
    pub fn new(segment: &str, field: usize, component: Option<usize>) -> Self {
        Self {
            segment: segment.to_owned(),
            field,
            component,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.field, self.component) {
            (0, _) => write!(f, "{} segment", self.segment),
            (field, Some(component)) => write!(f, "{}-{}.{}", self.segment, field, component),
            (field, None) => write!(f, "{}-{}", self.segment, field),
        }
    }
}

/// A component: plain text, or two or more subcomponents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Component {
    Scalar(String),
    Composite(Vec<String>),
}

impl Component {
    /// Returns the 1-based subcomponent. A scalar component has exactly one subcomponent.
    pub fn subcomponent(&self, index: usize) -> Option<&str> {
        match self {
            Component::Scalar(value) if index == 1 => Some(value),
            Component::Scalar(_) => None,
            Component::Composite(parts) => parts.get(index.checked_sub(1)?).map(String::as_str),
        }
    }

    /// The component text; for composites, the first subcomponent.
    pub fn as_str(&self) -> &str {
        self.subcomponent(1).unwrap_or_default()
    }

    pub(crate) fn encode_into(&self, out: &mut String, delimiters: &Delimiters) {
        match self {
            Component::Scalar(value) => out.push_str(value),
            Component::Composite(parts) => join_into(out, parts, delimiters.subcomponent),
        }
    }
}

/// One occurrence of a field: plain text, or two or more components.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Repetition {
    Scalar(String),
    Composite(Vec<Component>),
}

impl Repetition {
    /// Returns the 1-based component. A scalar repetition has exactly one component.
    pub fn component(&self, index: usize) -> Option<ComponentRef<'_>> {
        match self {
            Repetition::Scalar(value) if index == 1 => Some(ComponentRef::Text(value)),
            Repetition::Scalar(_) => None,
            Repetition::Composite(components) => components
                .get(index.checked_sub(1)?)
                .map(ComponentRef::Component),
        }
    }

    /// Text of the 1-based component (first subcomponent for composites).
    pub fn value(&self, index: usize) -> Option<&str> {
        self.component(index).map(|c| c.as_str())
    }

    /// Number of components in this repetition.
    pub fn len(&self) -> usize {
        match self {
            Repetition::Scalar(_) => 1,
            Repetition::Composite(components) => components.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Repetition::Scalar(value) if value.is_empty())
    }

    fn encode_into(&self, out: &mut String, delimiters: &Delimiters) {
        match self {
            Repetition::Scalar(value) => out.push_str(value),
            Repetition::Composite(components) => {
                for (idx, component) in components.iter().enumerate() {
                    if idx > 0 {
                        out.push(delimiters.component);
                    }
                    component.encode_into(out, delimiters);
                }
            }
        }
    }
}

/// Borrowed view of a component, whether it came from a scalar repetition or a composite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentRef<'a> {
    Text(&'a str),
    Component(&'a Component),
}

impl<'a> ComponentRef<'a> {
    pub fn as_str(&self) -> &'a str {
        match self {
            ComponentRef::Text(text) => text,
            ComponentRef::Component(component) => component.as_str(),
        }
    }

    pub fn subcomponent(&self, index: usize) -> Option<&'a str> {
        match self {
            ComponentRef::Text(text) if index == 1 => Some(text),
            ComponentRef::Text(_) => None,
            ComponentRef::Component(component) => component.subcomponent(index),
        }
    }
}

/// A field: one or more repetitions. An empty field is a single empty scalar repetition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Field(Vec<Repetition>);

impl Field {
    pub(crate) fn new(repetitions: Vec<Repetition>) -> Self {
        debug_assert!(!repetitions.is_empty());
        Self(repetitions)
    }

    /// A field holding literal text that is never split (MSH-1 and MSH-2).
    pub(crate) fn literal(text: impl Into<String>) -> Self {
        Self(vec![Repetition::Scalar(text.into())])
    }

    pub fn repetitions(&self) -> &[Repetition] {
        &self.0
    }

    /// The first repetition; every field has at least one.
    pub fn first(&self) -> &Repetition {
        &self.0[0]
    }

    /// Text of the 1-based component of the first repetition.
    pub fn value(&self, component: usize) -> Option<&str> {
        self.first().value(component)
    }

    /// `true` when the field carries no text at all.
    pub fn is_empty(&self) -> bool {
        self.0.len() == 1 && self.0[0].is_empty()
    }

    pub(crate) fn encode_into(&self, out: &mut String, delimiters: &Delimiters) {
        for (idx, repetition) in self.0.iter().enumerate() {
            if idx > 0 {
                out.push(delimiters.repetition);
            }
            repetition.encode_into(out, delimiters);
        }
    }
}

/// A segment: a three character tag plus positional fields.
///
/// `fields[0]` is field 1. For the `MSH` header, field 1 is the field separator itself and
/// field 2 holds the encoding characters verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub tag: String,
    pub fields: Vec<Field>,
}

impl Segment {
    /// Returns the 1-based field, or `None` if the segment is shorter.
    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index.checked_sub(1)?)
    }

    /// Text at `(field, component)` of the first repetition, failing closed.
    ///
    /// # Errors
    ///
    /// Returns [`Hl7Error::NotFound`] if the field or component does not exist. An existing but
    /// empty field yields `Ok("")`; emptiness is a semantic concern for the caller.
    pub fn value(&self, field: usize, component: usize) -> Hl7Result<&str> {
        self.field(field)
            .and_then(|f| f.value(component))
            .ok_or_else(|| Hl7Error::NotFound {
                location: Location::new(&self.tag, field, Some(component)),
            })
    }

    /// Text at `(field, component)` when present and non-empty.
    pub fn non_empty(&self, field: usize, component: usize) -> Option<&str> {
        self.value(field, component)
            .ok()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn is_header(&self) -> bool {
        self.tag == HEADER_TAG
    }

    pub(crate) fn encode_into(&self, out: &mut String, delimiters: &Delimiters) {
        out.push_str(&self.tag);
        let skip = if self.is_header() {
            // MSH-1 is the separator itself; MSH-2 follows it directly.
            out.push(delimiters.field);
            out.push_str(&delimiters.encoding_characters());
            2
        } else {
            0
        };
        for field in self.fields.iter().skip(skip) {
            out.push(delimiters.field);
            field.encode_into(out, delimiters);
        }
    }
}

/// A parsed message. Only [`crate::parse`] constructs one, so the header is always present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    delimiters: Delimiters,
    segments: Vec<Segment>,
    trailing_terminator: bool,
}

impl Message {
    pub(crate) fn new(
        delimiters: Delimiters,
        segments: Vec<Segment>,
        trailing_terminator: bool,
    ) -> Self {
        debug_assert!(segments.first().is_some_and(Segment::is_header));
        Self {
            delimiters,
            segments,
            trailing_terminator,
        }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    /// Every segment in message order, unknown tags included.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the source text ended with a segment terminator.
    pub fn trailing_terminator(&self) -> bool {
        self.trailing_terminator
    }

    /// The `MSH` header.
    pub fn header(&self) -> &Segment {
        &self.segments[0]
    }

    /// All segments with `tag`, in message order.
    pub fn by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.tag == tag)
    }

    pub fn first(&self, tag: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.tag == tag)
    }

    /// The first segment with `tag`, failing closed.
    pub fn require(&self, tag: &str) -> Hl7Result<&Segment> {
        self.first(tag).ok_or_else(|| Hl7Error::NotFound {
            location: Location::new(tag, 0, None),
        })
    }

    /// MSH-9 as `(message code, trigger event)`, e.g. `("ADT", "A01")`.
    pub fn message_type(&self) -> (&str, &str) {
        let header = self.header();
        (
            header.value(9, 1).unwrap_or_default(),
            header.value(9, 2).unwrap_or_default(),
        )
    }

    /// MSH-10, the message control id.
    pub fn control_id(&self) -> Option<&str> {
        self.header().non_empty(10, 1)
    }

    /// Re-serialises the message with its own delimiters and segment terminator.
    pub fn encode(&self) -> String {
        let terminator = self.delimiters.segment_terminator.as_str();
        let mut out = String::new();
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                out.push_str(terminator);
            }
            segment.encode_into(&mut out, &self.delimiters);
        }
        if self.trailing_terminator {
            out.push_str(terminator);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn join_into(out: &mut String, parts: &[String], separator: char) {
    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            out.push(separator);
        }
        out.push_str(part);
    }
}
