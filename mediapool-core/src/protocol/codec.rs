use super::crypto::{self, KeyPair};
use super::frame::{Frame, FrameKind};
use crate::{PoolError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use x25519_dalek::PublicKey;

/// Serializes `value` into a frame, sealed to `recipient` when given.
pub fn encode<T: Serialize>(value: &T, recipient: Option<&PublicKey>) -> Result<Frame> {
    let json = serde_json::to_vec(value)?;
    match recipient {
        Some(key) => Ok(Frame::sealed(crypto::seal(key, &json)?)),
        None => Ok(Frame::plain(json)),
    }
}

/// Opens and deserializes a frame. Sealed frames need the local key pair.
pub fn decode<T: DeserializeOwned>(frame: &Frame, keys: Option<&KeyPair>) -> Result<T> {
    let json = match frame.kind {
        FrameKind::Plain => frame.payload.clone(),
        FrameKind::Sealed => {
            let keys = keys.ok_or_else(|| {
                PoolError::Protocol("received a sealed frame without a key pair".to_string())
            })?;
            keys.open(&frame.payload)?
        }
    };

    serde_json::from_slice(&json)
        .map_err(|error| PoolError::Protocol(format!("malformed envelope: {}", error)))
}
