use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Key derivation failed")]
    KeyDerivationFailed,

    #[error("Malformed ciphertext: expected iv:tag:ciphertext hex triple")]
    MalformedCiphertext,
}

#[derive(Error, Debug)]
pub enum TotpError {
    #[error("Invalid base32 secret")]
    InvalidSecret,

    #[error("QR encoding failed: {0}")]
    QrEncoding(String),
}
