//! Small validated value types shared by every Sentinel crate.
//!
//! - [`NonEmptyText`] guarantees trimmed, non-empty text.
//! - [`nhs_number`] implements the modulus-11 check digit used by NHS numbers, and the
//!   [`NhsNumber`] carrier that pairs a 9-digit body with its declared check digit.

pub mod nhs_number;
mod text;

pub use nhs_number::{ChecksumError, NhsNumber};
pub use text::{NonEmptyText, TextError};
