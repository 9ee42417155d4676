//! PostgreSQL Wire Protocol (pure, sync)
//!
//! No I/O here: frontend messages are encoded into byte buffers and backend
//! messages decoded from them. The driver owns the socket.

pub mod auth;
pub mod error;
pub mod types;
pub mod wire;

pub use auth::{SCRAM_SHA_256, ScramClient, md5_password};
pub use error::EncodeError;
pub use types::{oid, type_name};
pub use wire::*;
