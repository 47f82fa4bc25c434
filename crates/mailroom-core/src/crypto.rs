use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be valid base64")]
    KeyNotBase64,
    #[error("encryption key must decode to 32 bytes (AES-256)")]
    KeyWrongLength,
    #[error("encrypted blob is too short")]
    BlobTooShort,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

/// AES-256-GCM sealer for OAuth tokens at rest. Ciphertexts are
/// `nonce (12 bytes) || ciphertext+tag`, bound to their row via AAD.
#[derive(Clone, Debug)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    pub fn from_base64_key(raw: &str) -> Result<Self, CryptoError> {
        let decoded = BASE64
            .decode(raw.trim())
            .map_err(|_| CryptoError::KeyNotBase64)?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| CryptoError::KeyWrongLength)?;
        Ok(Self { key })
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::BlobTooShort);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptFailed)
    }
}
