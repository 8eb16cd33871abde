//! Arbitrary-precision integer byte encoding (spec §3.2, §4.6).
//!
//! `BigInt` fields are stored as the shortest two's-complement little-endian
//! byte sequence that preserves sign; `BigUInt` fields as the shortest
//! unsigned little-endian sequence. Both are interned into their own shared
//! element store (`bigint.bin` / `biguint.bin`) and referenced from the
//! owning composite's slot as a `(start, length)` run, same as a string.

use num_bigint::{BigInt, BigUint};

/// Encodes `value` as the shortest little-endian two's-complement byte
/// sequence. Zero encodes as a single `0x00` byte, matching the "at least
/// one byte" expectation of a `(start, length)` slot with `length >= 1` for
/// any non-null value (an explicit null uses `(0, 0)` and the bitmap bit,
/// never a zero-length BigInt run).
pub fn encode_bigint(value: &BigInt) -> Vec<u8> {
  let bytes = value.to_signed_bytes_le();
  if bytes.is_empty() {
    vec![0]
  } else {
    bytes
  }
}

/// Inverse of [`encode_bigint`].
pub fn decode_bigint(bytes: &[u8]) -> BigInt {
  BigInt::from_signed_bytes_le(bytes)
}

/// Encodes `value` as the shortest little-endian unsigned byte sequence.
pub fn encode_biguint(value: &BigUint) -> Vec<u8> {
  let bytes = value.to_bytes_le();
  if bytes.is_empty() {
    vec![0]
  } else {
    bytes
  }
}

/// Inverse of [`encode_biguint`].
pub fn decode_biguint(bytes: &[u8]) -> BigUint {
  BigUint::from_bytes_le(bytes)
}

#[cfg(test)]
mod test {
  use super::*;
  use num_traits::{One, Zero};

  #[test]
  fn zero_encodes_to_single_byte() {
    assert_eq!(vec![0u8], encode_bigint(&BigInt::zero()));
    assert_eq!(vec![0u8], encode_biguint(&BigUint::zero()));
  }

  #[test]
  fn round_trip_negative() {
    let v = BigInt::from(-300i64);
    let bytes = encode_bigint(&v);
    assert_eq!(v, decode_bigint(&bytes));
  }

  #[test]
  fn round_trip_large_positive() {
    let v = (BigUint::one() << 512) + BigUint::from(7u32);
    let bytes = encode_biguint(&v);
    assert_eq!(v, decode_biguint(&bytes));
  }

  #[test]
  fn shortest_encoding_for_small_values() {
    let v = BigInt::from(1i64);
    assert_eq!(1, encode_bigint(&v).len());
  }
}
