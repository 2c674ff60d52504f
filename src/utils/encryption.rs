use aes_gcm::{aead::Aead, aead::KeyInit, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::{OsRng, RngCore};

const NONCE_LEN: usize = 12;
const SEALED_PREFIX: &str = "enc:v1:";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption key must be 32 bytes")]
    InvalidKeyLength,
    #[error("failed to encrypt credentials")]
    Encrypt,
    #[error("failed to decrypt credentials")]
    Decrypt,
    #[error("invalid ciphertext encoding")]
    InvalidEncoding,
    #[error("credentials are encrypted but no key is configured")]
    MissingKey,
}

/// AES-256-GCM sealing for the credentials blob at rest. Sealed values are
/// tagged so rows written before a key was configured still read back.
#[derive(Clone)]
pub struct CredentialCipher {
    key: Vec<u8>,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn from_base64(key_b64: &str) -> Result<Self, EncryptionError> {
        let key = STANDARD
            .decode(key_b64.trim())
            .map_err(|_| EncryptionError::InvalidEncoding)?;
        Self::from_bytes(key)
    }

    pub fn from_bytes(key: Vec<u8>) -> Result<Self, EncryptionError> {
        if key.len() != 32 {
            return Err(EncryptionError::InvalidKeyLength);
        }
        Ok(Self { key })
    }

    fn cipher(&self) -> Result<Aes256Gcm, EncryptionError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| EncryptionError::InvalidKeyLength)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, EncryptionError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| EncryptionError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(combined)))
    }

    pub fn open(&self, stored: &str) -> Result<String, EncryptionError> {
        let Some(encoded) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_string());
        };
        let data = STANDARD
            .decode(encoded)
            .map_err(|_| EncryptionError::InvalidEncoding)?;
        if data.len() <= NONCE_LEN {
            return Err(EncryptionError::InvalidEncoding);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| EncryptionError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| EncryptionError::Decrypt)
    }
}

pub fn is_sealed(stored: &str) -> bool {
    stored.starts_with(SEALED_PREFIX)
}

/// Reads a stored blob with an optional cipher. Plain rows pass through.
pub fn open_stored(cipher: Option<&CredentialCipher>, stored: &str) -> Result<String, EncryptionError> {
    match cipher {
        Some(cipher) => cipher.open(stored),
        None if is_sealed(stored) => Err(EncryptionError::MissingKey),
        None => Ok(stored.to_string()),
    }
}

pub fn seal_for_storage(
    cipher: Option<&CredentialCipher>,
    plaintext: &str,
) -> Result<String, EncryptionError> {
    match cipher {
        Some(cipher) => cipher.seal(plaintext),
        None => Ok(plaintext.to_string()),
    }
}
