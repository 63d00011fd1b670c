//! Arithmetic modulo the secp256k1 field prime `p = 2^256 - 2^32 - 977`.
//!
//! Values are unsigned big integers, so every result is already in
//! `[0, modulus)` once reduced. Subtraction goes through [`sub_mod`], which adds
//! the modulus before reducing.

use bitcoin::secp256k1::constants::FIELD_SIZE;
use lazy_static::lazy_static;
use num_bigint::BigUint;

lazy_static! {
    /// The field prime p
    pub static ref FIELD_PRIME: BigUint = BigUint::from_bytes_be(&FIELD_SIZE);

    /// (p + 1) / 4, valid because p ≡ 3 (mod 4)
    static ref SQRT_EXPONENT: BigUint = (&*FIELD_PRIME + 1u32) / 4u32;
}

/// Reduce `a` into `[0, modulus)`
pub fn modulo(a: &BigUint, modulus: &BigUint) -> BigUint {
    a % modulus
}

/// `(a - b) mod modulus` without leaving the unsigned domain
pub(crate) fn sub_mod(a: &BigUint, b: &BigUint, modulus: &BigUint) -> BigUint {
    modulo(&(modulo(a, modulus) + modulus - modulo(b, modulus)), modulus)
}

/// `(a * b) mod modulus`
pub(crate) fn mul_mod(a: &BigUint, b: &BigUint, modulus: &BigUint) -> BigUint {
    modulo(&(a * b), modulus)
}

/// Square-and-multiply exponentiation.
///
/// Walks every bit of `exponent` from least to most significant, squaring on
/// each step and multiplying in the running square when the bit is set.
///
/// # Panics
/// If `modulus` is zero.
pub fn mod_pow(base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> BigUint {
    let mut result = modulo(&BigUint::from(1u8), modulus);
    let mut square = modulo(base, modulus);

    for bit in 0..exponent.bits() {
        if exponent.bit(bit) {
            result = mul_mod(&result, &square, modulus);
        }
        square = mul_mod(&square, &square, modulus);
    }

    result
}

/// Multiplicative inverse modulo `modulus`, if `a` is invertible
pub fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    modulo(a, modulus).modinv(modulus)
}

/// Square root modulo p, if `a` is a quadratic residue.
///
/// Only one of the two roots is returned; the caller picks the parity it needs.
pub fn sqrt_mod_p(a: &BigUint) -> Option<BigUint> {
    let a = modulo(a, &FIELD_PRIME);
    let root = mod_pow(&a, &SQRT_EXPONENT, &FIELD_PRIME);
    if mul_mod(&root, &root, &FIELD_PRIME) == a {
        Some(root)
    } else {
        None
    }
}
