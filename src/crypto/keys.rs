//! Key pairs and x-only public keys.

use super::point::{generator, point_mul, to_bytes32, Point, CURVE_ORDER};
use crate::error::{GrailError, GrailResult};
use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use num_bigint::BigUint;
use rand::Rng;
use std::fmt;

/// A private scalar in `[1, n - 1]` and its x-only public key
#[derive(Clone)]
pub struct KeyPair {
    keypair: Keypair,
    public_key: XOnlyPublicKey,
}

impl KeyPair {
    /// Build a key pair from a 32-byte private scalar
    pub fn from_secret_bytes(secret: &[u8; 32]) -> GrailResult<Self> {
        check_scalar(secret)?;

        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(secret)
            .map_err(|e| GrailError::crypto(format!("secret key: {}", e)))?;
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (public_key, _parity) = keypair.x_only_public_key();

        Ok(Self {
            keypair,
            public_key,
        })
    }

    /// Build a key pair from a hex-encoded private scalar
    pub fn from_hex(secret_hex: &str) -> GrailResult<Self> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|e| GrailError::InvalidScalar {
            reason: format!("private key is not hex: {}", e),
        })?;
        let secret: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| GrailError::InvalidScalar {
            reason: format!("private key must be 32 bytes, got {}", b.len()),
        })?;
        Self::from_secret_bytes(&secret)
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

fn check_scalar(secret: &[u8; 32]) -> GrailResult<BigUint> {
    let k = BigUint::from_bytes_be(secret);
    if k.bits() == 0 || k >= *CURVE_ORDER {
        return Err(GrailError::InvalidScalar {
            reason: "private key must lie in [1, n - 1]".to_string(),
        });
    }
    Ok(k)
}

/// x-only public key of a private scalar, computed as `k·G`
pub fn derive_x_only(secret: &[u8; 32]) -> GrailResult<[u8; 32]> {
    let k = check_scalar(secret)?;
    let point = point_mul(Some(&generator()), &k).ok_or_else(|| GrailError::InvalidScalar {
        reason: "scalar multiple is the point at infinity".to_string(),
    })?;
    Ok(to_bytes32(&point.x))
}

/// Parse a hex x-only public key, checking that it lifts to a curve point
pub fn parse_x_only(key_hex: &str) -> GrailResult<XOnlyPublicKey> {
    let bytes = hex::decode(key_hex.trim()).map_err(|e| GrailError::InvalidPoint {
        reason: format!("public key is not hex: {}", e),
    })?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| GrailError::InvalidPoint {
        reason: format!("x-only public key must be 32 bytes, got {}", b.len()),
    })?;

    Point::from_x_only(&bytes)?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| GrailError::InvalidPoint {
        reason: e.to_string(),
    })
}

/// Fresh random key pairs
pub fn generate_keypairs(count: usize) -> GrailResult<Vec<KeyPair>> {
    let mut rng = rand::rng();
    let mut pairs = Vec::with_capacity(count);

    while pairs.len() < count {
        let mut secret = [0u8; 32];
        rng.fill(&mut secret);
        // out-of-range draws are vanishingly rare; just draw again
        if check_scalar(&secret).is_ok() {
            pairs.push(KeyPair::from_secret_bytes(&secret)?);
        }
    }

    Ok(pairs)
}
