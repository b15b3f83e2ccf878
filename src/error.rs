use thiserror::Error;

/// Error kinds from the error-handling design: per-packet errors are caught
/// and logged by the caller and never escalate; per-session errors abort the
/// owning session; per-endpoint errors abort the endpoint and surface to the
/// CLI.
#[derive(Debug, Error)]
pub enum VoipError {
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("codec failure: {0}")]
    CodecFailure(String),

    #[error("cipher failure: {0}")]
    CipherFailure(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    #[error("stale packet: sequence {sequence} older than floor {floor}")]
    Stale { sequence: u32, floor: u32 },

    #[error("buffer overflow: {0}")]
    Overflow(String),
}

pub type VoipResult<T> = Result<T, VoipError>;
