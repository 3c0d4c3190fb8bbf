//! Password hashing with scrypt, stored as `salt_hex:derived_hex`.

use rand::RngCore;
use scrypt::Params;
use subtle::ConstantTimeEq;

use crate::constants::{PASSWORD_SALT_LEN, SCRYPT_KEY_LEN, SCRYPT_LOG_N, SCRYPT_P, SCRYPT_R};
use crate::error::CryptoError;

fn params() -> Result<Params, CryptoError> {
    Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_KEY_LEN)
        .map_err(|_| CryptoError::KeyDerivationFailed)
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut derived = [0u8; SCRYPT_KEY_LEN];
    scrypt::scrypt(password.as_bytes(), &salt, &params()?, &mut derived)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;

    Ok(format!("{}:{}", hex::encode(salt), hex::encode(derived)))
}

/// Verify a password against a stored `salt_hex:derived_hex` hash.
///
/// Returns false on any shape mismatch; the derived-key comparison is
/// constant-time.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, derived_hex)) = stored.split_once(':') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(derived_hex) else {
        return false;
    };
    if expected.len() != SCRYPT_KEY_LEN {
        return false;
    }

    let Ok(params) = params() else {
        return false;
    };
    let mut derived = [0u8; SCRYPT_KEY_LEN];
    if scrypt::scrypt(password.as_bytes(), &salt, &params, &mut derived).is_err() {
        return false;
    }

    derived.ct_eq(expected.as_slice()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password entirely", &hash));
    }

    #[test]
    fn stored_format_is_salt_and_key() {
        let hash = hash_password("some password here").unwrap();
        let (salt_hex, derived_hex) = hash.split_once(':').unwrap();
        assert_eq!(salt_hex.len(), PASSWORD_SALT_LEN * 2);
        assert_eq!(derived_hex.len(), SCRYPT_KEY_LEN * 2);
    }

    #[test]
    fn same_password_different_salts() {
        let h1 = hash_password("repeat after me").unwrap();
        let h2 = hash_password("repeat after me").unwrap();
        assert_ne!(h1, h2);
        assert!(verify_password("repeat after me", &h1));
        assert!(verify_password("repeat after me", &h2));
    }

    #[test]
    fn malformed_hash_rejected() {
        assert!(!verify_password("anything", ""));
        assert!(!verify_password("anything", "nocolon"));
        assert!(!verify_password("anything", "zzzz:zzzz"));
        assert!(!verify_password("anything", "aabb:ccdd"));
    }
}
