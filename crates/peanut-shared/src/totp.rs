//! RFC 6238 time-based one-time passwords (SHA-1, 30 s step, 6 digits),
//! plus enrolment helpers: secret generation, otpauth URI, QR data URL,
//! and one-shot backup codes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use qrcode::render::svg;
use qrcode::QrCode;
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::constants::{
    APP_NAME, BACKUP_CODE_COUNT, BACKUP_CODE_LEN, TOTP_DIGITS, TOTP_SECRET_LEN, TOTP_STEP_SECS,
    TOTP_WINDOW,
};
use crate::error::TotpError;

type HmacSha1 = Hmac<Sha1>;

const B32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// Generate a fresh base32 secret (uppercase, no padding).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; TOTP_SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base32::encode(B32, &bytes)
}

fn hotp(key: &[u8], counter: u64) -> Result<u32, TotpError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| TotpError::InvalidSecret)?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 4226 §5.3).
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);

    Ok(bin % 10u32.pow(TOTP_DIGITS))
}

/// The 6-digit code for a base32 secret at the given unix time.
pub fn code_at(secret: &str, unix_secs: u64) -> Result<String, TotpError> {
    let key = base32::decode(B32, secret).ok_or(TotpError::InvalidSecret)?;
    let counter = unix_secs / TOTP_STEP_SECS;
    let code = hotp(&key, counter)?;
    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Check a submitted code against the secret, accepting ±1 step of skew.
pub fn verify_code(secret: &str, code: &str, unix_secs: u64) -> bool {
    if code.len() != TOTP_DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let Some(key) = base32::decode(B32, secret) else {
        return false;
    };

    let step = unix_secs / TOTP_STEP_SECS;
    for skew in -TOTP_WINDOW..=TOTP_WINDOW {
        let Some(counter) = step.checked_add_signed(skew) else {
            continue;
        };
        let Ok(expected) = hotp(&key, counter) else {
            return false;
        };
        let expected = format!("{expected:0width$}", width = TOTP_DIGITS as usize);
        if expected.as_bytes().ct_eq(code.as_bytes()).unwrap_u8() == 1 {
            return true;
        }
    }
    false
}

/// otpauth:// provisioning URI for authenticator apps.
pub fn otpauth_uri(account: &str, secret: &str) -> String {
    format!(
        "otpauth://totp/{APP_NAME}:{account}?secret={secret}&issuer={APP_NAME}\
         &algorithm=SHA1&digits={TOTP_DIGITS}&period={TOTP_STEP_SECS}"
    )
}

/// Render a provisioning URI as an SVG QR code, base64 data URL.
pub fn qr_data_url(uri: &str) -> Result<String, TotpError> {
    let code = QrCode::new(uri.as_bytes()).map_err(|e| TotpError::QrEncoding(e.to_string()))?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(240, 240)
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", BASE64.encode(image)))
}

/// Mint the enrolment set of single-use backup codes (8 uppercase hex chars).
pub fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; BACKUP_CODE_LEN / 2];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            hex::encode_upper(bytes)
        })
        .collect()
}

/// Shape check for a submitted backup code.
pub fn looks_like_backup_code(code: &str) -> bool {
    code.len() == BACKUP_CODE_LEN && code.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B vectors (SHA-1 secret "12345678901234567890"),
    // truncated to 6 digits.
    fn rfc_secret() -> String {
        base32::encode(B32, b"12345678901234567890")
    }

    #[test]
    fn rfc6238_test_vectors() {
        let secret = rfc_secret();
        assert_eq!(code_at(&secret, 59).unwrap(), "287082");
        assert_eq!(code_at(&secret, 1_111_111_109).unwrap(), "081804");
        assert_eq!(code_at(&secret, 1_111_111_111).unwrap(), "050471");
        assert_eq!(code_at(&secret, 1_234_567_890).unwrap(), "005924");
    }

    #[test]
    fn verify_accepts_adjacent_steps() {
        let secret = rfc_secret();
        let code = code_at(&secret, 1_000_000_000).unwrap();

        assert!(verify_code(&secret, &code, 1_000_000_000));
        assert!(verify_code(&secret, &code, 1_000_000_000 + 30));
        assert!(verify_code(&secret, &code, 1_000_000_000 - 30));
        assert!(!verify_code(&secret, &code, 1_000_000_000 + 90));
    }

    #[test]
    fn verify_rejects_garbage() {
        let secret = rfc_secret();
        assert!(!verify_code(&secret, "12345", 59));
        assert!(!verify_code(&secret, "abcdef", 59));
        assert!(!verify_code(&secret, "0000000", 59));
    }

    #[test]
    fn generated_secret_decodes() {
        let secret = generate_secret();
        let bytes = base32::decode(B32, &secret).unwrap();
        assert_eq!(bytes.len(), TOTP_SECRET_LEN);
    }

    #[test]
    fn backup_codes_shape() {
        let codes = generate_backup_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert!(looks_like_backup_code(code));
            assert_eq!(code.to_uppercase(), *code);
        }
    }

    #[test]
    fn qr_data_url_prefix() {
        let uri = otpauth_uri("admin@peanut.local", &rfc_secret());
        let url = qr_data_url(&uri).unwrap();
        assert!(url.starts_with("data:image/svg+xml;base64,"));
    }
}
