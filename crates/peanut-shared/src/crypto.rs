use aes_gcm::aead::generic_array::{typenum::U16, GenericArray};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::AesGcm;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::{VAULT_IV_SIZE, VAULT_KEY_SIZE, VAULT_TAG_SIZE};
use crate::error::CryptoError;

/// AES-256-GCM with the 16-byte IV the stored ciphertext format carries.
type VaultCipher = AesGcm<Aes256, U16>;

pub type VaultKey = [u8; VAULT_KEY_SIZE];

/// Derive the vault key from the `VAULT_KEY_HEX` environment value.
///
/// The hex string is decoded, then zero-padded or truncated to exactly
/// 32 bytes. A value that is not valid hex is taken as raw bytes, so a
/// misconfigured key still yields a stable (if weak) key rather than a
/// startup failure.
pub fn vault_key_from_hex(key_hex: &str) -> VaultKey {
    let bytes = hex::decode(key_hex.trim()).unwrap_or_else(|_| key_hex.as_bytes().to_vec());
    let mut key = [0u8; VAULT_KEY_SIZE];
    let n = bytes.len().min(VAULT_KEY_SIZE);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Encrypt `plaintext` and return the `iv_hex:tag_hex:ciphertext_hex` triple.
pub fn encrypt_to_string(key: &VaultKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let cipher = VaultCipher::new(GenericArray::from_slice(key));

    let mut iv = [0u8; VAULT_IV_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    // The aead API appends the 16-byte tag; split it back off so the
    // stored format keeps the tag as its own field.
    let sealed = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - VAULT_TAG_SIZE);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

/// Decrypt an `iv_hex:tag_hex:ciphertext_hex` triple, verifying the tag.
pub fn decrypt_from_string(key: &VaultKey, stored: &str) -> Result<Vec<u8>, CryptoError> {
    let mut parts = stored.splitn(3, ':');
    let (iv_hex, tag_hex, ct_hex) = match (parts.next(), parts.next(), parts.next()) {
        (Some(iv), Some(tag), Some(ct)) => (iv, tag, ct),
        _ => return Err(CryptoError::MalformedCiphertext),
    };

    let iv = hex::decode(iv_hex).map_err(|_| CryptoError::MalformedCiphertext)?;
    let tag = hex::decode(tag_hex).map_err(|_| CryptoError::MalformedCiphertext)?;
    let ciphertext = hex::decode(ct_hex).map_err(|_| CryptoError::MalformedCiphertext)?;

    if iv.len() != VAULT_IV_SIZE || tag.len() != VAULT_TAG_SIZE {
        return Err(CryptoError::MalformedCiphertext);
    }

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let cipher = VaultCipher::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(&iv), sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Fresh opaque 128-bit identifier, lowercase hex (32 chars).
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 digest as lowercase hex (64 chars).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
