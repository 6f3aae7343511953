use thiserror::Error;

#[derive(Error, Debug)]
pub enum RillError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("input session already exists: {0}")]
    InputExists(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("short payload: need {need}, got {got}")]
    ShortPayload { need: usize, got: usize },

    #[error("invalid codec data: {0}")]
    InvalidCodecData(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("adts not initialized")]
    AdtsNotInited,

    #[error("relay error: {0}")]
    Relay(String),

    #[error("write queue closed")]
    WriteQueueClosed,

    #[error("hls error: {0}")]
    Hls(String),
}

pub type Result<T> = std::result::Result<T, RillError>;
