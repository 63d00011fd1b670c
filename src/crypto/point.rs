//! Affine points on `y² = x³ + 7` over the secp256k1 field.
//!
//! The point at infinity is represented as `None`; every operation takes and
//! returns `Option<Point>` so the identity never needs a sentinel encoding.

use super::field::{mod_inverse, mod_pow, modulo, mul_mod, sqrt_mod_p, sub_mod, FIELD_PRIME};
use crate::error::{GrailError, GrailResult};
use bitcoin::secp256k1::constants::{CURVE_ORDER as ORDER_BYTES, GENERATOR_X, GENERATOR_Y};
use lazy_static::lazy_static;
use num_bigint::BigUint;

/// Bits walked by [`point_mul`]
const SCALAR_BITS: u64 = 256;

lazy_static! {
    /// Order n of the generator. Scalars live modulo n, coordinates modulo p.
    pub static ref CURVE_ORDER: BigUint = BigUint::from_bytes_be(&ORDER_BYTES);

    static ref GENERATOR: Point = Point {
        x: BigUint::from_bytes_be(&GENERATOR_X),
        y: BigUint::from_bytes_be(&GENERATOR_Y),
    };
}

/// A finite curve point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Point {
    pub x: BigUint,
    pub y: BigUint,
}

impl Point {
    /// Check the curve equation
    pub fn is_on_curve(&self) -> bool {
        let p = &*FIELD_PRIME;
        if &self.x >= p || &self.y >= p {
            return false;
        }
        mul_mod(&self.y, &self.y, p) == curve_rhs(&self.x)
    }

    /// 32-byte big-endian x coordinate
    pub fn x_only_bytes(&self) -> [u8; 32] {
        to_bytes32(&self.x)
    }

    /// Lift a 32-byte x-only key to its even-y point
    pub fn from_x_only(bytes: &[u8; 32]) -> GrailResult<Self> {
        lift_x(&BigUint::from_bytes_be(bytes))
    }
}

/// The curve generator G
pub fn generator() -> Point {
    GENERATOR.clone()
}

/// Big-endian, left-padded to 32 bytes. Inputs are below 2^256.
pub(crate) fn to_bytes32(n: &BigUint) -> [u8; 32] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; 32];
    let start = 32usize.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
    out
}

fn curve_rhs(x: &BigUint) -> BigUint {
    let p = &*FIELD_PRIME;
    modulo(&(mod_pow(x, &BigUint::from(3u8), p) + 7u32), p)
}

/// Point with the given x coordinate and even y.
///
/// Fails with `InvalidPoint` when x is not a field element or `x³ + 7` has no
/// square root.
pub fn lift_x(x: &BigUint) -> GrailResult<Point> {
    let p = &*FIELD_PRIME;
    if x >= p {
        return Err(GrailError::InvalidPoint {
            reason: "x coordinate is not below the field prime".to_string(),
        });
    }

    let y = sqrt_mod_p(&curve_rhs(x)).ok_or_else(|| GrailError::InvalidPoint {
        reason: format!("no curve point with x = {:064x}", x),
    })?;
    let y = if y.bit(0) { p - y } else { y };

    Ok(Point { x: x.clone(), y })
}

/// Whether the point's y coordinate is even
pub fn has_even_y(point: &Point) -> bool {
    !point.y.bit(0)
}

/// Affine addition and doubling.
///
/// `P + (-P)` and any sum involving only the identity yield the identity.
pub fn point_add(p1: Option<&Point>, p2: Option<&Point>) -> Option<Point> {
    let (a, b) = match (p1, p2) {
        (None, None) => return None,
        (None, Some(b)) => return Some(b.clone()),
        (Some(a), None) => return Some(a.clone()),
        (Some(a), Some(b)) => (a, b),
    };
    let p = &*FIELD_PRIME;

    if a.x == b.x && a.y != b.y {
        return None;
    }

    let lambda = if a == b {
        // tangent slope 3x² / 2y
        let numerator = mul_mod(&BigUint::from(3u8), &mul_mod(&a.x, &a.x, p), p);
        let denominator = mod_inverse(&(&a.y * 2u32), p)?;
        mul_mod(&numerator, &denominator, p)
    } else {
        let numerator = sub_mod(&b.y, &a.y, p);
        let denominator = mod_inverse(&sub_mod(&b.x, &a.x, p), p)?;
        mul_mod(&numerator, &denominator, p)
    };

    let x = sub_mod(&sub_mod(&mul_mod(&lambda, &lambda, p), &a.x, p), &b.x, p);
    let y = sub_mod(&mul_mod(&lambda, &sub_mod(&a.x, &x, p), p), &a.y, p);

    Some(Point { x, y })
}

/// Double-and-add scalar multiplication.
///
/// Always walks all 256 bits of `k`, including the zero bits above its highest
/// set bit. Bits beyond 256 are ignored.
pub fn point_mul(point: Option<&Point>, k: &BigUint) -> Option<Point> {
    let mut result: Option<Point> = None;
    let mut addend = point.cloned();

    for bit in 0..SCALAR_BITS {
        if k.bit(bit) {
            result = point_add(result.as_ref(), addend.as_ref());
        }
        addend = point_add(addend.as_ref(), addend.as_ref());
    }

    result
}
