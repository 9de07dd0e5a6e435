//! Master/worker wire protocol: message model, line framing and the
//! challenge-response handshake.

pub mod auth;
pub mod codec;
pub mod message;

pub use auth::{compute_response, AuthManager, AuthOptions};
pub use codec::{framed, MessageReader, MessageWriter, ProtocolError};
pub use message::{Message, MessageType};
