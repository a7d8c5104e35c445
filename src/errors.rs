use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid stream id: {message}")]
    InvalidStreamId { message: String },

    #[error("Transcoder launch failed: {message}")]
    Launch { message: String },

    #[error("Process did not terminate within {waited_secs}s")]
    KillTimeout { waited_secs: u64 },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Network address parse error: {source}")]
    AddrParse {
        #[from]
        source: std::net::AddrParseError,
    },
}

impl RelayError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn invalid_stream_id(message: impl Into<String>) -> Self {
        Self::InvalidStreamId { message: message.into() }
    }

    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
