// Cryptography module — P-256 key material, Web Push content decryption,
// VAPID sender verification

pub mod vapid;
pub mod webpush;

use p256::ecdh;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::codec;

/// Length of the per-subscription auth secret mixed into key derivation.
pub const AUTH_SECRET_LEN: usize = 16;
/// Length of an uncompressed P-256 public point (leading 0x04).
pub const PUBLIC_KEY_LEN: usize = 65;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("malformed key material: {0}")]
    BadKey(String),
    #[error("encrypted record is truncated")]
    TruncatedRecord,
    #[error("unsupported key id length {0}, expected 65")]
    BadKeyIdLength(u8),
    #[error("invalid nonce length {0}, expected 12")]
    BadNonceLength(usize),
    #[error("key derivation failed")]
    Derive,
    #[error("decryption failed")]
    Aead,
    #[error("bad record padding")]
    Padding,
}

/// JSON Web Key projection of a P-256 private key, the shape this engine
/// persists under `privateEncKey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub d: String,
    pub x: String,
    pub y: String,
    pub ext: bool,
    pub key_ops: Vec<String>,
}

/// ECDH P-256 keypair backing one push subscription.
#[derive(Clone)]
pub struct EcKeyPair {
    secret: SecretKey,
}

impl EcKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// The uncompressed public point; its base64url form is the `p256dh`
    /// value senders encrypt against.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.secret.public_key().to_encoded_point(false);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(point.as_bytes());
        bytes
    }

    pub fn to_jwk(&self) -> Jwk {
        let point = self.secret.public_key().to_encoded_point(false);
        let d = Zeroizing::new(self.secret.to_bytes().to_vec());
        Jwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            d: codec::base64url_encode(d.as_slice()),
            x: codec::base64url_encode(point.x().expect("uncompressed point has x").as_slice()),
            y: codec::base64url_encode(point.y().expect("uncompressed point has y").as_slice()),
            ext: true,
            key_ops: vec!["deriveKey".to_string(), "deriveBits".to_string()],
        }
    }

    /// Rebuild a keypair from its JWK projection. Fails only on malformed
    /// key material, including public coordinates that do not belong to the
    /// private scalar.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, CryptoError> {
        if jwk.kty != "EC" || jwk.crv != "P-256" {
            return Err(CryptoError::BadKey(format!(
                "unsupported key type {}/{}",
                jwk.kty, jwk.crv
            )));
        }
        let d = Zeroizing::new(
            codec::base64url_decode(&jwk.d)
                .map_err(|e| CryptoError::BadKey(format!("bad private scalar: {e}")))?,
        );
        let secret = SecretKey::from_slice(&d)
            .map_err(|e| CryptoError::BadKey(format!("bad private scalar: {e}")))?;

        let point = secret.public_key().to_encoded_point(false);
        let x = codec::base64url_encode(point.x().expect("uncompressed point has x").as_slice());
        let y = codec::base64url_encode(point.y().expect("uncompressed point has y").as_slice());
        if x != jwk.x || y != jwk.y {
            return Err(CryptoError::BadKey(
                "public coordinates do not match the private scalar".to_string(),
            ));
        }

        Ok(Self { secret })
    }

    /// Raw ECDH shared secret with a peer's uncompressed public point.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; 32], CryptoError> {
        let peer = PublicKey::from_sec1_bytes(peer_public)
            .map_err(|e| CryptoError::BadKey(format!("bad peer public key: {e}")))?;
        let shared = ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes());
        Ok(out)
    }
}

impl std::fmt::Debug for EcKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcKeyPair")
            .field("public", &codec::base64url_encode(&self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Fresh 16-byte auth secret from the OS CSPRNG.
pub fn generate_auth_secret() -> [u8; AUTH_SECRET_LEN] {
    let mut secret = [0u8; AUTH_SECRET_LEN];
    secret.copy_from_slice(&codec::random_bytes(AUTH_SECRET_LEN));
    secret
}
