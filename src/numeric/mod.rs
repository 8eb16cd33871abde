//! Arbitrary-precision numerics (BigInt/BigUInt/Fraction) and the overflow
//! policy attached to primitive-integer fields.

pub mod bigint;
pub mod fraction;
pub mod overflow;

pub use bigint::{decode_bigint, decode_biguint, encode_bigint, encode_biguint};
pub use fraction::{decode_fraction, encode_fraction};
pub use overflow::OverflowPolicy;
