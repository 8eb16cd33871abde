//! Exact rational values (spec §3.2, §4.6).
//!
//! A `Fraction` slot is `(num_start, num_len, den_start, den_len)`: the
//! numerator and denominator are interned separately into two dedicated
//! byte stores (`_frac_num.bin`, signed; `_frac_den.bin`, unsigned). The
//! value is normalised before either half is interned: sign lives on the
//! numerator, and numerator/denominator are reduced by their gcd.

use crate::numeric::bigint::{decode_bigint, decode_biguint, encode_bigint, encode_biguint};
use num_bigint::{BigInt, BigUint};
use num_rational::BigRational;

/// Normalises `value` (gcd reduction + sign-on-numerator happens inside
/// `BigRational` itself) and returns the byte encodings of its numerator and
/// denominator, ready to be interned into the fraction byte stores.
pub fn encode_fraction(value: &BigRational) -> (Vec<u8>, Vec<u8>) {
  let num = value.numer();
  let den = value.denom().to_biguint().expect("BigRational denominator is always positive");
  (encode_bigint(num), encode_biguint(&den))
}

/// Reconstructs a `BigRational` from its numerator/denominator byte
/// encodings. `BigRational::new` re-normalises on construction, so a
/// mal-reduced pair of bytes (which should never occur for values this
/// engine wrote) is tolerated rather than trusted blindly.
pub fn decode_fraction(num_bytes: &[u8], den_bytes: &[u8]) -> BigRational {
  let num: BigInt = decode_bigint(num_bytes);
  let den: BigInt = decode_biguint(den_bytes).into();
  BigRational::new(num, den)
}

#[cfg(test)]
mod test {
  use super::*;
  use num_traits::Zero;

  #[test]
  fn normalises_sign_onto_numerator() {
    let r = BigRational::new(BigInt::from(3), BigInt::from(-4));
    let (num, den) = encode_fraction(&r);
    let back = decode_fraction(&num, &den);
    assert_eq!(r, back);
    assert!(back.numer() < &BigInt::zero());
    assert!(back.denom() > &BigInt::zero());
  }

  #[test]
  fn reduces_by_gcd() {
    let r = BigRational::new(BigInt::from(6), BigInt::from(8));
    assert_eq!(BigInt::from(3), *r.numer());
    assert_eq!(BigInt::from(4), *r.denom());
  }

  #[test]
  fn round_trip_zero() {
    let r = BigRational::new(BigInt::from(0), BigInt::from(1));
    let (num, den) = encode_fraction(&r);
    assert_eq!(r, decode_fraction(&num, &den));
  }
}
