use crate::{EncodingConfig, PoolError, Result};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const NONCE_LEN: usize = 24;

/// Server side encryption of stored media content.
///
/// Stored layout: `nonce(24) || ciphertext`. Key number 0 means the file is
/// stored as is.
pub struct MediaEncoder {
    enabled: bool,
    current_key: u32,
    ciphers: BTreeMap<u32, XChaCha20Poly1305>,
}

impl MediaEncoder {
    pub fn new(config: &EncodingConfig) -> Result<Self> {
        config.validate()?;

        let ciphers = config
            .keys
            .iter()
            .map(|key| (key.number, cipher_for_secret(&key.secret)))
            .collect();

        Ok(Self {
            enabled: config.enabled,
            current_key: config.key_number,
            ciphers,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            current_key: 0,
            ciphers: BTreeMap::new(),
        }
    }

    /// Key number to use for a new file, or 0 when nothing should be encoded.
    pub fn key_for(&self, server_encoding: bool) -> u32 {
        if self.enabled && server_encoding {
            self.current_key
        } else {
            0
        }
    }

    pub fn encode(&self, key_number: u32, plain: &[u8]) -> Result<Vec<u8>> {
        if key_number == 0 {
            return Ok(plain.to_vec());
        }

        let cipher = self.cipher(key_number)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plain)
            .map_err(|error| PoolError::Crypto(format!("media encoding failed: {}", error)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decode(&self, key_number: u32, stored: &[u8]) -> Result<Vec<u8>> {
        if key_number == 0 {
            return Ok(stored.to_vec());
        }

        if stored.len() < NONCE_LEN {
            return Err(PoolError::Crypto(
                "encoded media file is truncated".to_string(),
            ));
        }

        let cipher = self.cipher(key_number)?;
        let (nonce, sealed) = stored.split_at(NONCE_LEN);
        cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|error| PoolError::Crypto(format!("media decoding failed: {}", error)))
    }

    fn cipher(&self, key_number: u32) -> Result<&XChaCha20Poly1305> {
        self.ciphers.get(&key_number).ok_or_else(|| {
            PoolError::Crypto(format!("encoding key {} is not configured", key_number))
        })
    }
}

fn cipher_for_secret(secret: &str) -> XChaCha20Poly1305 {
    let digest = Sha256::digest(secret.as_bytes());
    XChaCha20Poly1305::new(Key::from_slice(&digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EncodingKey;

    fn config(enabled: bool) -> EncodingConfig {
        EncodingConfig {
            enabled,
            key_number: 2,
            keys: EncodingKey::parse_list("1:old-secret,2:new-secret").unwrap(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let encoder = MediaEncoder::new(&config(true)).unwrap();
        let key = encoder.key_for(true);
        assert_eq!(key, 2);

        let stored = encoder.encode(key, b"jpeg bytes").unwrap();
        assert_ne!(stored.as_slice(), b"jpeg bytes");
        assert_eq!(encoder.decode(key, &stored).unwrap(), b"jpeg bytes");

        // A file written under an older key stays readable.
        let old = encoder.encode(1, b"older").unwrap();
        assert_eq!(encoder.decode(1, &old).unwrap(), b"older");
        assert!(encoder.decode(2, &old).is_err());
    }

    #[test]
    fn test_key_selection() {
        let disabled = MediaEncoder::new(&config(false)).unwrap();
        assert_eq!(disabled.key_for(true), 0);

        let enabled = MediaEncoder::new(&config(true)).unwrap();
        assert_eq!(enabled.key_for(false), 0);
        assert_eq!(enabled.encode(0, b"raw").unwrap(), b"raw");
        assert!(enabled.decode(9, b"0123456789012345678901234567").is_err());
    }
}
