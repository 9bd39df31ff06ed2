//! AEAD sealing for chat payloads

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use thiserror::Error;

use super::ChatKey;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("no chat key established for peer")]
    MissingKey,

    #[error("malformed payload: {0}")]
    Encoding(String),

    #[error("authentication failed")]
    Authentication,
}

/// One encrypted chat payload as it travels over the relay.
#[derive(Debug, Clone)]
pub struct SealedChat {
    pub iv: String,
    pub ct: String,
}

/// Encrypts `text` for a single peer with a fresh random nonce.
pub fn seal(key: &ChatKey, text: &str) -> Result<SealedChat, ChatError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ct = cipher
        .encrypt(&nonce, text.as_bytes())
        .map_err(|_| ChatError::Encoding("aead seal failure".to_string()))?;
    Ok(SealedChat {
        iv: BASE64.encode(nonce),
        ct: BASE64.encode(ct),
    })
}

/// Decrypts a payload with the sender's pair key.
///
/// Fails closed: a tampered ciphertext or nonce yields `Authentication`,
/// never corrupted plaintext.
pub fn open(key: &ChatKey, iv: &str, ct: &str) -> Result<String, ChatError> {
    let iv = BASE64
        .decode(iv)
        .map_err(|e| ChatError::Encoding(e.to_string()))?;
    if iv.len() != 12 {
        return Err(ChatError::Encoding(format!("nonce length {}", iv.len())));
    }
    let ct = BASE64
        .decode(ct)
        .map_err(|e| ChatError::Encoding(e.to_string()))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let plain = cipher
        .decrypt(Nonce::from_slice(&iv), ct.as_ref())
        .map_err(|_| ChatError::Authentication)?;
    String::from_utf8(plain).map_err(|e| ChatError::Encoding(e.to_string()))
}
