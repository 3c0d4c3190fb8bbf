/// Application name (otpauth issuer, log banner)
pub const APP_NAME: &str = "PeanutGateway";

/// AES-256-GCM key size in bytes
pub const VAULT_KEY_SIZE: usize = 32;

/// Vault IV size in bytes (stored as the first hex field of the ciphertext)
pub const VAULT_IV_SIZE: usize = 16;

/// Vault authentication tag size in bytes
pub const VAULT_TAG_SIZE: usize = 16;

/// scrypt cost parameter: N = 2^14 = 16384
pub const SCRYPT_LOG_N: u8 = 14;

/// scrypt block size
pub const SCRYPT_R: u32 = 8;

/// scrypt parallelism
pub const SCRYPT_P: u32 = 1;

/// Derived key length in bytes
pub const SCRYPT_KEY_LEN: usize = 64;

/// Password salt length in bytes
pub const PASSWORD_SALT_LEN: usize = 32;

/// Minimum password length for new and changed passwords
pub const MIN_PASSWORD_LEN: usize = 12;

/// Session token lifetime (8 hours)
pub const SESSION_TTL_SECS: i64 = 8 * 60 * 60;

/// Intermediate (TOTP-pending) token lifetime (10 minutes)
pub const INTERMEDIATE_TTL_SECS: i64 = 10 * 60;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "auth_token";

/// TOTP time step in seconds (RFC 6238)
pub const TOTP_STEP_SECS: u64 = 30;

/// TOTP code length in digits
pub const TOTP_DIGITS: u32 = 6;

/// Accepted clock skew, in steps, on either side of now
pub const TOTP_WINDOW: i64 = 1;

/// Raw TOTP secret length in bytes (before base32 encoding)
pub const TOTP_SECRET_LEN: usize = 20;

/// Number of one-shot backup codes minted at enrolment
pub const BACKUP_CODE_COUNT: usize = 10;

/// Backup code length in uppercase hex characters
pub const BACKUP_CODE_LEN: usize = 8;

/// Previous-fingerprint sentinel for the first audit entry
pub const GENESIS_FINGERPRINT: &str = "GENESIS";

/// Default HTTP listen port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
