//! Numeric value encoding and folding.
//!
//! Numeric stores keep every value as its decimal string so snapshots stay
//! readable and independent of machine width. `bigdecimal` results are rounded
//! half-even to the configured scale and normalized, so equal numbers always
//! serialize to equal bytes.

use std::cmp::Ordering;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use num_bigint::BigInt;
use substreams_core::ValueType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Add,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Numeric {
    Int64(i64),
    Float64(f64),
    BigInt(BigInt),
    BigDecimal(BigDecimal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NumericError {
    Invalid(String),
    Int64Overflow,
    NotANumber,
    /// Operands of different types; only reachable through a store bug.
    Mismatch,
}

impl Numeric {
    /// Decode stored or guest-supplied bytes as `value_type`.
    pub fn parse(value_type: &ValueType, bytes: &[u8]) -> Result<Self, NumericError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| NumericError::Invalid(e.to_string()))?
            .trim();
        let invalid = |e: &dyn std::fmt::Display| NumericError::Invalid(format!("{text:?}: {e}"));
        match value_type {
            ValueType::Int64 => text.parse().map(Numeric::Int64).map_err(|e| invalid(&e)),
            ValueType::Float64 => {
                let v: f64 = text.parse().map_err(|e| invalid(&e))?;
                Numeric::float(v)
            }
            ValueType::BigInt => BigInt::from_str(text)
                .map(Numeric::BigInt)
                .map_err(|e| invalid(&e)),
            ValueType::BigDecimal => BigDecimal::from_str(text)
                .map(Numeric::BigDecimal)
                .map_err(|e| invalid(&e)),
            other => Err(NumericError::Invalid(format!("{other} is not numeric"))),
        }
    }

    pub fn float(v: f64) -> Result<Self, NumericError> {
        if v.is_nan() {
            return Err(NumericError::NotANumber);
        }
        Ok(Numeric::Float64(v))
    }

    pub fn encode(&self, scale: i64) -> Vec<u8> {
        match self {
            Numeric::Int64(v) => v.to_string().into_bytes(),
            Numeric::Float64(v) => v.to_string().into_bytes(),
            Numeric::BigInt(v) => v.to_string().into_bytes(),
            Numeric::BigDecimal(v) => normalize(v, scale).to_string().into_bytes(),
        }
    }

    /// Fold `other` into `self`.
    pub fn combine(self, other: Numeric, op: NumericOp) -> Result<Numeric, NumericError> {
        match op {
            NumericOp::Add => self.add(other),
            NumericOp::Min => self.pick(other, Ordering::Less),
            NumericOp::Max => self.pick(other, Ordering::Greater),
        }
    }

    fn add(self, other: Numeric) -> Result<Numeric, NumericError> {
        match (self, other) {
            (Numeric::Int64(a), Numeric::Int64(b)) => a
                .checked_add(b)
                .map(Numeric::Int64)
                .ok_or(NumericError::Int64Overflow),
            (Numeric::Float64(a), Numeric::Float64(b)) => Numeric::float(a + b),
            (Numeric::BigInt(a), Numeric::BigInt(b)) => Ok(Numeric::BigInt(a + b)),
            (Numeric::BigDecimal(a), Numeric::BigDecimal(b)) => Ok(Numeric::BigDecimal(a + b)),
            _ => Err(NumericError::Mismatch),
        }
    }

    /// Keep `other` when it compares `wanted` against `self`.
    fn pick(self, other: Numeric, wanted: Ordering) -> Result<Numeric, NumericError> {
        let ord = match (&other, &self) {
            (Numeric::Int64(a), Numeric::Int64(b)) => a.cmp(b),
            (Numeric::Float64(a), Numeric::Float64(b)) => {
                a.partial_cmp(b).ok_or(NumericError::NotANumber)?
            }
            (Numeric::BigInt(a), Numeric::BigInt(b)) => a.cmp(b),
            (Numeric::BigDecimal(a), Numeric::BigDecimal(b)) => a.cmp(b),
            _ => return Err(NumericError::Mismatch),
        };
        Ok(if ord == wanted { other } else { self })
    }
}

fn normalize(v: &BigDecimal, scale: i64) -> BigDecimal {
    v.with_scale_round(scale, RoundingMode::HalfEven).normalized()
}

/// Combine two stored encodings under `op`. `None` on the left means the key
/// was absent and the right value is taken as is.
pub fn fold_encoded(
    value_type: &ValueType,
    current: Option<&[u8]>,
    incoming: &[u8],
    op: NumericOp,
    scale: i64,
) -> Result<Vec<u8>, NumericError> {
    let incoming = Numeric::parse(value_type, incoming)?;
    let result = match current {
        Some(current) => Numeric::parse(value_type, current)?.combine(incoming, op)?,
        None => incoming,
    };
    Ok(result.encode(scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(vt: ValueType, cur: Option<&str>, inc: &str, op: NumericOp) -> Result<String, NumericError> {
        fold_encoded(&vt, cur.map(str::as_bytes), inc.as_bytes(), op, 34)
            .map(|b| String::from_utf8(b).unwrap())
    }

    #[test]
    fn int64_add_and_overflow() {
        assert_eq!(fold(ValueType::Int64, Some("40"), "2", NumericOp::Add).unwrap(), "42");
        assert_eq!(
            fold(ValueType::Int64, Some(i64::MAX.to_string().as_str()), "1", NumericOp::Add),
            Err(NumericError::Int64Overflow)
        );
    }

    #[test]
    fn bigint_add_of_two_negatives() {
        assert_eq!(
            fold(
                ValueType::BigInt,
                Some("-99999999999999999999999"),
                "-1",
                NumericOp::Add
            )
            .unwrap(),
            "-100000000000000000000000"
        );
    }

    #[test]
    fn bigdecimal_is_rounded_and_normalized() {
        assert_eq!(fold(ValueType::BigDecimal, Some("1.50"), "2.25", NumericOp::Add).unwrap(), "3.75");
        let third = fold_encoded(
            &ValueType::BigDecimal,
            None,
            b"0.33333333333333333333333333333333333333",
            NumericOp::Add,
            4,
        )
        .unwrap();
        assert_eq!(third, b"0.3333");
    }

    #[test]
    fn min_max_initial_write_takes_value() {
        assert_eq!(fold(ValueType::Int64, None, "7", NumericOp::Min).unwrap(), "7");
        assert_eq!(fold(ValueType::Int64, Some("7"), "3", NumericOp::Min).unwrap(), "3");
        assert_eq!(fold(ValueType::Int64, Some("7"), "3", NumericOp::Max).unwrap(), "7");
        assert_eq!(fold(ValueType::Float64, Some("1.5"), "2.5", NumericOp::Max).unwrap(), "2.5");
    }

    #[test]
    fn nan_and_garbage_are_rejected() {
        assert_eq!(
            fold(ValueType::Float64, None, "NaN", NumericOp::Add),
            Err(NumericError::NotANumber)
        );
        assert!(matches!(
            fold(ValueType::Int64, None, "twelve", NumericOp::Add),
            Err(NumericError::Invalid(_))
        ));
    }
}
