//! Legacy pipe-delimited message grammar.
//!
//! This crate turns raw legacy message text into a typed tree and back again:
//!
//! ```text
//! Message
//! └── Segment (tag: "PID")
//!     └── Field            (field separator,       usually '|')
//!         └── Repetition   (repetition separator,  usually '~')
//!             └── Component    (component separator,   usually '^')
//!                 └── subcomponent (subcomponent separator, usually '&')
//! ```
//!
//! Delimiters are read from the `MSH` header of each message rather than assumed, so a feed
//! that declares (or has been corrupted into) unusual delimiters is parsed with its own rules.
//!
//! Responsibilities:
//! - structural parsing ([`parse`]) and byte-identical re-encoding ([`Message::encode`]),
//! - 1-based positional lookups that fail closed with [`Hl7Error::NotFound`],
//! - escape-sequence decoding for text values ([`Delimiters::unescape`]).
//!
//! Semantic checks (is this field numeric? is this code known?) belong to callers.

mod delimiters;
mod parser;
mod tree;

pub use delimiters::{Delimiters, SegmentTerminator};
pub use parser::parse;
pub use tree::{Component, ComponentRef, Field, Location, Message, Repetition, Segment};

/// Tag of the header segment that declares the message delimiters.
pub const HEADER_TAG: &str = "MSH";

/// Errors returned by the `hl7` crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Hl7Error {
    /// The text cannot be read as a legacy message at all.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A positional lookup addressed something the message does not contain.
    #[error("{location} not present in message")]
    NotFound { location: Location },
}

/// Type alias for Results that can fail with an [`Hl7Error`].
pub type Hl7Result<T> = Result<T, Hl7Error>;
