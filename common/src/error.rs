use thiserror::Error;

/// 线路协议错误（控制通道、数据通道、发现信标）
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    Bincode(String),

    #[error("Beacon JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Chunk too large: {size} bytes (limit {limit})")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("Unknown frame format: {0:#x}")]
    UnknownFormat(u32),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Unsupported beacon version: {0}")]
    UnsupportedVersion(u32),
}

impl From<bincode::Error> for ProtocolError {
    fn from(error: bincode::Error) -> Self {
        ProtocolError::Bincode(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
