//! Overflow policy (spec §4.8): attached to a specific integer field, applied
//! on every write to that field's slot, including chained mutations.

use crate::error::ValueError;
use serde::{Deserialize, Serialize};

/// How a value that doesn't fit a field's declared integer range is handled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
  /// Reject out-of-range values with a range error. The default.
  Error,
  /// Clamp to the min/max of the declared type.
  Saturating,
  /// Reduce modulo the type's cardinality, preserving two's complement for
  /// signed types.
  Wrapping,
}

impl Default for OverflowPolicy {
  fn default() -> Self {
    OverflowPolicy::Error
  }
}

impl OverflowPolicy {
  /// Applies this policy to a signed value being written into a field whose
  /// declared range is `[min, max]`. Narrowing conversions (the caller
  /// passing a value that doesn't fit in `width` bits at all, as opposed to
  /// just outside `[min, max]`) always error regardless of policy; that
  /// case is handled by the caller before this is invoked.
  pub fn apply_signed(
    self,
    field: &str,
    value: i128,
    min: i128,
    max: i128,
  ) -> Result<i128, ValueError> {
    if value >= min && value <= max {
      return Ok(value);
    }
    match self {
      OverflowPolicy::Error => Err(ValueError::Overflow {
        field: field.to_string(),
        value: value.to_string(),
      }),
      OverflowPolicy::Saturating => Ok(value.clamp(min, max)),
      OverflowPolicy::Wrapping => {
        let span = max - min + 1;
        let wrapped = ((value - min).rem_euclid(span)) + min;
        Ok(wrapped)
      }
    }
  }

  /// As [`apply_signed`](Self::apply_signed) but for unsigned fields.
  pub fn apply_unsigned(
    self,
    field: &str,
    value: u128,
    max: u128,
  ) -> Result<u128, ValueError> {
    if value <= max {
      return Ok(value);
    }
    match self {
      OverflowPolicy::Error => Err(ValueError::Overflow {
        field: field.to_string(),
        value: value.to_string(),
      }),
      OverflowPolicy::Saturating => Ok(max),
      OverflowPolicy::Wrapping => {
        let span = max as u128 + 1;
        Ok(value % span)
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn saturating_clamps_to_max() {
    let p = OverflowPolicy::Saturating;
    assert_eq!(127, p.apply_signed("x", 200, -128, 127).unwrap());
  }

  #[test]
  fn wrapping_reduces_modulo_cardinality() {
    let p = OverflowPolicy::Wrapping;
    assert_eq!(1, p.apply_unsigned("y", 257, 255).unwrap());
  }

  #[test]
  fn error_policy_rejects_out_of_range() {
    let p = OverflowPolicy::Error;
    assert!(p.apply_signed("z", 200, -128, 127).is_err());
  }

  #[test]
  fn in_range_values_pass_through_untouched() {
    let p = OverflowPolicy::Error;
    assert_eq!(42, p.apply_signed("z", 42, -128, 127).unwrap());
  }
}
