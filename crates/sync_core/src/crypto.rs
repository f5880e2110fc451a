use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid key material")]
    InvalidKey,
}

/// Capability boundary around the message cipher. Both operations may fail;
/// the pipeline owns the fallback behavior (plain envelope on encrypt
/// failure, retained envelope on decrypt failure) so a gateway error is
/// never a dropped message.
pub trait CryptoGateway: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, envelope: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// No-op gateway for tests and plaintext development relays.
pub struct PassthroughCrypto;

impl CryptoGateway for PassthroughCrypto {
    fn encrypt(&self, plaintext: &[u8], _key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, envelope: &[u8], _key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(envelope.to_vec())
    }
}

/// XChaCha20-Poly1305 with the 24-byte nonce prepended to the ciphertext.
pub struct SealedCrypto;

impl SealedCrypto {
    fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKey);
        }
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)
    }
}

impl CryptoGateway for SealedCrypto {
    fn encrypt(&self, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn decrypt(&self, envelope: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let cipher = Self::cipher(key)?;
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_SIZE);
        cipher
            .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Fresh random per-chat key material.
pub fn generate_chat_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_round_trip() {
        let key = generate_chat_key();
        let envelope = SealedCrypto.encrypt(b"salut", &key).expect("encrypt");
        assert_ne!(&envelope[NONCE_SIZE..], b"salut");
        let plaintext = SealedCrypto.decrypt(&envelope, &key).expect("decrypt");
        assert_eq!(plaintext, b"salut");
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let envelope = SealedCrypto
            .encrypt(b"secret", &generate_chat_key())
            .expect("encrypt");
        assert!(SealedCrypto.decrypt(&envelope, &generate_chat_key()).is_err());
    }

    #[test]
    fn tampered_envelope_fails_decrypt() {
        let key = generate_chat_key();
        let mut envelope = SealedCrypto.encrypt(b"secret", &key).expect("encrypt");
        let last = envelope.len() - 1;
        envelope[last] ^= 0xff;
        assert!(SealedCrypto.decrypt(&envelope, &key).is_err());
    }

    #[test]
    fn short_envelope_is_rejected() {
        assert!(SealedCrypto.decrypt(&[0u8; 4], &generate_chat_key()).is_err());
    }

    #[test]
    fn bad_key_length_is_rejected() {
        assert!(SealedCrypto.encrypt(b"x", &[0u8; 7]).is_err());
    }
}
