//! Envelope encryption to a recipient's X25519 public key.
//!
//! Sealed layout: `ephemeral_public(32) || nonce(12) || ciphertext`.

use crate::{PoolError, Result};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KDF_CONTEXT: &[u8] = b"mediapool-envelope-v1";

/// Long-lived key pair of a server or client.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_hex(value: &str) -> Result<Self> {
        let secret = StaticSecret::from(decode_key(value)?);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn public_hex(&self) -> String {
        public_key_hex(&self.public)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Decrypts a payload sealed to this key pair.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < KEY_LEN + NONCE_LEN {
            return Err(PoolError::Crypto("sealed payload is truncated".to_string()));
        }

        let (sender, rest) = sealed.split_at(KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut sender_bytes = [0u8; KEY_LEN];
        sender_bytes.copy_from_slice(sender);
        let sender = PublicKey::from(sender_bytes);

        let shared = self.secret.diffie_hellman(&sender);
        let cipher = envelope_cipher(&shared, &sender, &self.public)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PoolError::Crypto("sealed payload could not be opened".to_string()))
    }
}

/// Encrypts `plain` so that only the owner of `recipient` can read it.
pub fn seal(recipient: &PublicKey, plain: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);

    let cipher = envelope_cipher(&shared, &ephemeral_public, recipient)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plain)
        .map_err(|_| PoolError::Crypto("payload could not be sealed".to_string()))?;

    let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn public_key_hex(key: &PublicKey) -> String {
    hex::encode(key.as_bytes())
}

pub fn parse_public_key(value: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode_key(value)?))
}

fn decode_key(value: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = hex::decode(value.trim())
        .map_err(|error| PoolError::Crypto(format!("invalid key encoding: {}", error)))?;
    bytes
        .try_into()
        .map_err(|_| PoolError::Crypto(format!("key must be {} bytes", KEY_LEN)))
}

fn envelope_cipher(
    shared: &SharedSecret,
    sender: &PublicKey,
    recipient: &PublicKey,
) -> Result<ChaCha20Poly1305> {
    if !shared.was_contributory() {
        return Err(PoolError::Crypto(
            "key agreement produced a non-contributory secret".to_string(),
        ));
    }

    let mut hasher = Sha256::new();
    hasher.update(KDF_CONTEXT);
    hasher.update(shared.as_bytes());
    hasher.update(sender.as_bytes());
    hasher.update(recipient.as_bytes());
    let key = hasher.finalize();

    Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
}
