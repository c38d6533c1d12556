//! Exact conversion from an integer string in a coin's smallest unit (e.g.
//! satoshis) to a fixed-point [`Decimal`] with a configurable number of
//! fractional digits.
//!
//! This exists because the wallet peer reports balances as plain integer
//! strings ("150000000") together with a separately-known precision (e.g. 8),
//! and the conversion to a human-denominated amount ("1.50000000") must not
//! go through binary floating point, which cannot represent most decimal
//! fractions exactly and would silently corrupt balance math.
//!
//! ```
//! # use common::decimal::parse_smallest_unit;
//! # use rust_decimal_macros::dec;
//! assert_eq!(parse_smallest_unit("150000000", 8).unwrap(), dec!(1.50000000));
//! assert_eq!(parse_smallest_unit("5", 8).unwrap(), dec!(0.00000005));
//! ```

use std::str::FromStr;

use rust_decimal::Decimal;

/// Errors that can occur while parsing a smallest-unit integer string.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("integer string was empty")]
    Empty,
    #[error("integer string contained a non-digit character")]
    NotDigits,
    #[error("converted value did not fit in a Decimal")]
    Overflow,
}

/// Converts an integer string `s` in a coin's smallest unit into a
/// [`Decimal`] with `precision` fractional digits.
///
/// Given `s` of length `L`:
/// - If `L > precision`, the integer part is `s[0..L-precision]` and the
///   fractional part is `s[L-precision..L]`.
/// - Otherwise, the integer part is `"0"` and the fractional part is `s`
///   left-padded with zeros to length `precision`.
pub fn parse_smallest_unit(s: &str, precision: u32) -> Result<Decimal, Error> {
    if s.is_empty() {
        return Err(Error::Empty);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::NotDigits);
    }

    let p = precision as usize;
    let l = s.len();

    let text = if l > p {
        let (int_part, frac_part) = s.split_at(l - p);
        if frac_part.is_empty() {
            int_part.to_string()
        } else {
            format!("{int_part}.{frac_part}")
        }
    } else {
        format!("0.{s:0>p$}")
    };

    Decimal::from_str(&text).map_err(|_| Error::Overflow)
}

#[cfg(test)]
mod test {
    use proptest::{
        arbitrary::any,
        collection::vec,
        prop_assert_eq, proptest,
    };
    use rust_decimal_macros::dec;

    use super::*;

    /// Scenario from §4.E.1 / §8 scenario 2: 150000000 sats at precision 8
    /// becomes 1.50000000.
    #[test]
    fn threshold_crossed_example() {
        assert_eq!(
            parse_smallest_unit("150000000", 8).unwrap(),
            dec!(1.50000000)
        );
    }

    /// Fractional part shorter than the whole string length is left-padded.
    #[test]
    fn pads_short_strings() {
        assert_eq!(parse_smallest_unit("5", 8).unwrap(), dec!(0.00000005));
        assert_eq!(parse_smallest_unit("0", 8).unwrap(), dec!(0));
    }

    /// Precision of zero means the smallest unit already is the display unit.
    #[test]
    fn zero_precision_is_identity() {
        assert_eq!(parse_smallest_unit("42", 0).unwrap(), dec!(42));
    }

    #[test]
    fn rejects_empty_and_non_digits() {
        assert!(parse_smallest_unit("", 8).is_err());
        assert!(parse_smallest_unit("12a4", 8).is_err());
        assert!(parse_smallest_unit("-5", 8).is_err());
    }

    /// ∀ integer strings `s` and precisions `p`, `parse_smallest_unit(s, p)`
    /// multiplied by `10^p` equals `s` as an integer (ignoring leading-zero
    /// normalization). Equivalently: the parsed `Decimal`'s unscaled mantissa
    /// equals `s` parsed as a plain integer.
    #[test]
    fn roundtrips_through_scaling() {
        proptest!(|(
            digits in vec(any::<u8>().prop_map(|b| b'0' + b % 10), 1..20),
            precision in 0u32..15,
        )| {
            let s: String = digits.iter().map(|&b| b as char).collect();
            let parsed = parse_smallest_unit(&s, precision).unwrap();
            let expected: i128 = s.parse().unwrap();
            prop_assert_eq!(parsed.mantissa(), expected);
        })
    }
}
