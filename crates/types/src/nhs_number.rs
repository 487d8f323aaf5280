//! NHS number modulus-11 checksum.
//!
//! An NHS number is ten digits: a nine digit body followed by a single check digit. The check
//! digit is derived from the body as follows:
//!
//! 1. weight each body digit by `10, 9, ..., 2` (left to right) and sum the products,
//! 2. take the remainder of the sum modulo 11,
//! 3. the check digit is `11 - remainder`,
//! 4. a result of `11` becomes `0`,
//! 5. a result of `10` means the body can never form a valid NHS number.
//!
//! Step 5 is reported as [`ChecksumError::InvalidBody`] and is never coerced into a digit.
//! Every function in this module is pure and never panics on bad input.

use std::fmt;

/// Number of digits in an NHS number body.
pub const BODY_LEN: usize = 9;

/// Number of digits in a full NHS number (body plus check digit).
pub const NHS_NUMBER_LEN: usize = BODY_LEN + 1;

/// Errors returned by the checksum functions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChecksumError {
    /// The body is not exactly nine ASCII digits.
    #[error("NHS number body must be exactly 9 ASCII digits, got {0:?}")]
    MalformedBody(String),

    /// The body is well formed but has no valid check digit (remainder case 10).
    #[error("NHS number body {0} has no valid check digit")]
    InvalidBody(String),
}

/// Computes the modulus-11 check digit for a nine digit body.
///
/// # Errors
///
/// - [`ChecksumError::MalformedBody`] if `body` is not nine ASCII digits.
/// - [`ChecksumError::InvalidBody`] if the weighted remainder yields the reserved value 10.
pub fn check_digit(body: &str) -> Result<u8, ChecksumError> {
    if body.len() != BODY_LEN || !body.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ChecksumError::MalformedBody(body.to_owned()));
    }

    let total: u32 = body
        .bytes()
        .zip((2..=10u32).rev())
        .map(|(b, weight)| u32::from(b - b'0') * weight)
        .sum();

    match 11 - (total % 11) {
        11 => Ok(0),
        10 => Err(ChecksumError::InvalidBody(body.to_owned())),
        digit => Ok(digit as u8),
    }
}

/// Returns `true` when `digit` is the check digit of `body`.
///
/// Malformed bodies and bodies without a valid check digit always return `false`.
pub fn validate(body: &str, digit: u8) -> bool {
    matches!(check_digit(body), Ok(expected) if expected == digit)
}

/// Validates a full ten digit NHS number such as `"4010232137"`.
pub fn validate_nhs_number(value: &str) -> bool {
    match NhsNumber::parse(value) {
        Some(number) => number.is_valid(),
        None => false,
    }
}

/// An NHS number split into its body and *declared* check digit.
///
/// Construction only checks the shape (ten ASCII digits); it does not verify the checksum.
/// This lets the mapper carry whatever the source system declared, while the auditor decides
/// validity with [`NhsNumber::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NhsNumber {
    body: String,
    declared: u8,
}

impl NhsNumber {
    /// Splits a ten digit value into body and declared check digit.
    ///
    /// Returns `None` if `value` is not exactly ten ASCII digits.
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() != NHS_NUMBER_LEN || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (body, digit) = value.split_at(BODY_LEN);
        Some(Self {
            body: body.to_owned(),
            declared: digit.as_bytes()[0] - b'0',
        })
    }

    /// Pairs a body with a declared digit without recomputing anything.
    ///
    /// Returns `None` if the body is not nine digits or the digit is above 9.
    pub fn from_parts(body: &str, declared: u8) -> Option<Self> {
        if body.len() != BODY_LEN || !body.bytes().all(|b| b.is_ascii_digit()) || declared > 9 {
            return None;
        }
        Some(Self {
            body: body.to_owned(),
            declared,
        })
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn declared_check_digit(&self) -> u8 {
        self.declared
    }

    /// Recomputes the checksum and compares it with the declared digit.
    pub fn is_valid(&self) -> bool {
        validate(&self.body, self.declared)
    }

    /// Returns the same body with a different declared check digit.
    pub fn with_check_digit(&self, declared: u8) -> Option<Self> {
        Self::from_parts(&self.body, declared)
    }
}

impl fmt::Display for NhsNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.body, self.declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_known_check_digits() {
        assert_eq!(check_digit("401023213"), Ok(7));
        assert_eq!(check_digit("943476591"), Ok(9));
        assert_eq!(check_digit("943476706"), Ok(7));
        assert_eq!(check_digit("000000000"), Ok(0));
    }

    #[test]
    fn remainder_zero_maps_to_check_digit_zero() {
        // 9*10 + 4*9 + 3*8 + 4*7 + 7*6 + 6*5 + 0*4 + 0*3 + 7*2 = 264, 264 % 11 == 0
        assert_eq!(check_digit("943476007"), Ok(0));
    }

    #[test]
    fn reserved_remainder_is_invalid_body() {
        let err = check_digit("943476002").expect_err("weighted sum 254 leaves remainder 1");
        assert_eq!(err, ChecksumError::InvalidBody("943476002".into()));
        for digit in 0..=9 {
            assert!(!validate("943476002", digit));
        }
    }

    #[test]
    fn malformed_bodies_are_rejected_without_panicking() {
        for body in ["", "12345678", "1234567890", "94347670a", "９４３４７６７０６"] {
            assert!(matches!(
                check_digit(body),
                Err(ChecksumError::MalformedBody(_))
            ));
            assert!(!validate(body, 0));
        }
    }

    #[test]
    fn every_computed_digit_validates_across_a_sweep_of_bodies() {
        let mut invalid_bodies = 0;
        for n in (0..1_000_000_000u64).step_by(7_919) {
            let body = format!("{n:09}");
            match check_digit(&body) {
                Ok(digit) => {
                    assert!(validate(&body, digit), "{body} should validate");
                    for other in (0..=9).filter(|d| *d != digit) {
                        assert!(!validate(&body, other));
                    }
                }
                Err(ChecksumError::InvalidBody(_)) => {
                    invalid_bodies += 1;
                    assert!((0..=9).all(|d| !validate(&body, d)));
                }
                Err(other) => panic!("unexpected error for {body}: {other}"),
            }
        }
        assert!(invalid_bodies > 0);
    }

    #[test]
    fn validates_full_numbers() {
        assert!(validate_nhs_number("4010232137"));
        assert!(validate_nhs_number("9434767067"));
        assert!(!validate_nhs_number("9434767060"));
        assert!(validate_nhs_number("9999999999"));
        assert!(!validate_nhs_number("9999999998"));
        assert!(!validate_nhs_number("401023213"));
        assert!(!validate_nhs_number("401 023 2137"));
    }

    #[test]
    fn parse_pairs_body_with_declared_digit_without_recomputing() {
        let number = NhsNumber::parse("9434767060").expect("ten digits");
        assert_eq!(number.body(), "943476706");
        assert_eq!(number.declared_check_digit(), 0);
        assert!(!number.is_valid());
        assert_eq!(number.to_string(), "9434767060");

        let fixed = number.with_check_digit(7).expect("digit in range");
        assert!(fixed.is_valid());
        assert!(number.with_check_digit(10).is_none());
    }
}
