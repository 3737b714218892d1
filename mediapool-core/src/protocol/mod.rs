//! Wire protocol: envelopes, command identifiers, framing and encryption.

pub mod codec;
pub mod command;
pub mod crypto;
pub mod envelope;
pub mod frame;

pub use command::{CommandId, props};
pub use crypto::{KeyPair, parse_public_key, public_key_hex, seal};
pub use envelope::{ErrorBlock, RequestContainer, ResponseContainer};
pub use frame::{Frame, FrameKind, read_frame, write_frame};
