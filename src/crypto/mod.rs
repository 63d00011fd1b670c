//! # secp256k1 Arithmetic
//!
//! Field arithmetic, affine point operations and key pairs. The tap-tree
//! builder derives tweaked output keys with these primitives; nothing else in
//! the crate does curve math.

pub mod field;
pub mod keys;
pub mod point;

pub use field::{mod_inverse, mod_pow, modulo, sqrt_mod_p, FIELD_PRIME};
pub use keys::{generate_keypairs, parse_x_only, KeyPair};
pub use point::{generator, has_even_y, lift_x, point_add, point_mul, Point, CURVE_ORDER};
