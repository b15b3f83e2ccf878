pub mod audio;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod jitter;
pub mod media_transport;
pub mod relay;
pub mod session;
pub mod signaling;

pub use error::{VoipError, VoipResult};
