// Web Push content decryption — RFC 8188 aes128gcm records keyed per
// RFC 8291
//
// Flow:
// 1. Parse the record header: salt (16) | record size (4, BE) | idlen (1)
//    | sender public key (65, uncompressed P-256) | ciphertext+tag
// 2. ECDH: subscription private key × sender public key → shared_secret
// 3. IKM  = HKDF(auth_secret, shared_secret,
//               "WebPush: info\0" || recipient_pub || sender_pub, 32)
// 4. CEK  = HKDF(salt, IKM, "Content-Encoding: aes128gcm\0", 16)
// 5. nonce = HKDF(salt, IKM, "Content-Encoding: nonce\0", 12)
// 6. AES-128-GCM decrypt, then strip the record padding delimiter

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use super::{CryptoError, EcKeyPair, PUBLIC_KEY_LEN};

pub const CEK_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

const SALT_LEN: usize = 16;
// salt + record size + idlen
const HEADER_LEN: usize = SALT_LEN + 4 + 1;
const TAG_LEN: usize = 16;

const WEBPUSH_INFO_PREFIX: &[u8] = b"WebPush: info\0";
const CEK_INFO: &[u8] = b"Content-Encoding: aes128gcm\0";
const NONCE_INFO: &[u8] = b"Content-Encoding: nonce\0";

/// Key material and ciphertext extracted from one aes128gcm record.
pub struct DecryptPrep {
    pub cek: [u8; CEK_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Parse an aes128gcm record and derive the content-encryption key and
/// nonce for it (RFC 8291 §3).
pub fn decrypt_prep(
    keys: &EcKeyPair,
    auth_secret: &[u8],
    record: &[u8],
) -> Result<DecryptPrep, CryptoError> {
    if record.len() < HEADER_LEN {
        return Err(CryptoError::TruncatedRecord);
    }
    let salt = &record[..SALT_LEN];
    // Record size bounds multi-record streams; push payloads are a single
    // record, so it is parsed but not enforced here.
    let _record_size = u32::from_be_bytes(
        record[SALT_LEN..SALT_LEN + 4]
            .try_into()
            .expect("4-byte slice"),
    );
    let idlen = record[HEADER_LEN - 1];
    if idlen as usize != PUBLIC_KEY_LEN {
        return Err(CryptoError::BadKeyIdLength(idlen));
    }
    if record.len() < HEADER_LEN + PUBLIC_KEY_LEN + TAG_LEN {
        return Err(CryptoError::TruncatedRecord);
    }
    let sender_public = &record[HEADER_LEN..HEADER_LEN + PUBLIC_KEY_LEN];
    let ciphertext = record[HEADER_LEN + PUBLIC_KEY_LEN..].to_vec();

    let mut shared_secret = keys.shared_secret(sender_public)?;

    let mut info = Vec::with_capacity(WEBPUSH_INFO_PREFIX.len() + 2 * PUBLIC_KEY_LEN);
    info.extend_from_slice(WEBPUSH_INFO_PREFIX);
    info.extend_from_slice(&keys.public_key_bytes());
    info.extend_from_slice(sender_public);

    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), &shared_secret)
        .expand(&info, &mut ikm)
        .map_err(|_| CryptoError::Derive)?;
    shared_secret.zeroize();

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let mut cek = [0u8; CEK_LEN];
    hk.expand(CEK_INFO, &mut cek)
        .map_err(|_| CryptoError::Derive)?;
    let mut nonce = [0u8; NONCE_LEN];
    hk.expand(NONCE_INFO, &mut nonce)
        .map_err(|_| CryptoError::Derive)?;
    ikm.zeroize();

    Ok(DecryptPrep {
        cek,
        nonce,
        ciphertext,
    })
}

/// AES-128-GCM decryption. The trailing 16 bytes of `ciphertext` are the
/// authentication tag; additional data is empty.
pub fn aes_gcm_decrypt(
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != NONCE_LEN {
        return Err(CryptoError::BadNonceLength(iv.len()));
    }
    let cipher = Aes128Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::BadKey("AES key must be 16 bytes".to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Aead)
}

/// Strip the aes128gcm record padding: trailing zeros, then a delimiter of
/// 0x02 for the only/last record (0x01 otherwise). An all-zero block has no
/// delimiter and is rejected.
pub fn remove_padding(data: &[u8], is_last_record: bool) -> Result<Vec<u8>, CryptoError> {
    let delimiter = if is_last_record { 0x02 } else { 0x01 };
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    if end == 0 || data[end - 1] != delimiter {
        return Err(CryptoError::Padding);
    }
    Ok(data[..end - 1].to_vec())
}
