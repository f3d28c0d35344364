/// Crate-wide error type.
///
/// Authentication failures on the decrypt hot paths are deliberately *not*
/// errors: they surface as `None`, NaCl-style, so callers cannot tell which
/// stage rejected a frame. `Error` covers everything else: protocol misuse,
/// malformed wire frames, persistence problems, and fatal conditions.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Replay rejected: {0}")]
    Replay(String),

    #[error("Invalid wire frame: {0}")]
    Wire(String),

    #[error("Identity key error: {0}")]
    Identity(String),

    #[error("Trust store error: {0}")]
    Trust(String),

    #[error("State vault error: {0}")]
    Vault(String),

    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    #[error("Random number generation failed")]
    Random,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}
