use thiserror::Error;

/// Everything that can go wrong talking to a Pico or decoding its frames.
#[derive(Debug, Error)]
pub enum Error {
    /// The config connection could not be opened within the retry budget.
    #[error("Failed to connect after {attempts} attempts: {source}")]
    ConnectionFailure {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A field carries a type code this decoder does not understand. The
    /// field length depends on the type, so the rest of the frame is lost.
    #[error("Unknown field type 0x{field_type:02x} in field {field}")]
    UnknownFieldType { field: u8, field_type: u8 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The device described a sensor slot we cannot turn into a sensor.
    #[error("Invalid config for slot {pos}: {reason}")]
    InvalidConfig { pos: usize, reason: String },

    /// No complete response arrived in time. The device stays silent when a
    /// request has a bad CRC, so that case ends up here too.
    #[error("Timed out waiting for a response")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
