use crate::sensor::SessionState;
use common::{FrameFormat, ParameterKind};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 顶层错误
#[derive(Error, Debug)]
pub enum Error {
    // ========== 连接错误 ==========
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    // ========== 协议错误 ==========
    #[error("Protocol error: {0}")]
    Protocol(#[from] common::ProtocolError),

    // ========== 本地恢复的错误 ==========
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),

    // ========== 会话错误 ==========
    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Sensor already attached: {0}")]
    AlreadyAttached(String),

    // ========== 其他错误 ==========
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// 传输不可达或丢失（对会话致命，对Network无影响）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection lost: {0}")]
    Lost(String),

    #[error("control channel desynchronized after {0} malformed messages")]
    Desynchronized(u32),

    #[error("transport setup failed: {0}")]
    Transport(String),
}

/// 损坏或无法解码的访问单元（本地丢弃，不中断流）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("forbidden_zero_bit set in NAL unit type {nal_type}")]
    ForbiddenBit { nal_type: u8 },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("slice references unknown PPS {0}")]
    UnknownPps(u32),

    #[error("PPS references unknown SPS {0}")]
    UnknownSps(u32),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u32 },

    #[error("inter-coded slice without a reference picture")]
    MissingReference,

    #[error("reassembly buffer exceeded {limit} bytes")]
    BufferOverflow { limit: usize },

    #[error("codec failure: {0}")]
    Codec(String),
}

/// 录像写入失败（关闭写入器，不影响解码）
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("writer has failed and no longer accepts data")]
    WriterFailed,

    #[error("a recording is already active: {0}")]
    AlreadyRecording(String),

    #[error("no active recording")]
    NotRecording,

    #[error("recorder worker stopped unexpectedly")]
    WorkerGone,

    #[error("malformed recording: {0}")]
    Malformed(String),

    #[error("cannot record {0:?} streams (only H.264)")]
    UnsupportedFormat(FrameFormat),
}

/// 参数被拒绝、未知或超时
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("parameter {name} rejected: {reason}")]
    Rejected { name: String, reason: String },

    #[error("unknown parameter: {0}")]
    Unknown(String),

    #[error("parameter {0} is read-only")]
    ReadOnly(String),

    #[error("parameter {name} expects {expected:?}, got {actual:?}")]
    KindMismatch {
        name: String,
        expected: ParameterKind,
        actual: ParameterKind,
    },

    #[error("value {value} out of range for parameter {name}")]
    OutOfRange { name: String, value: String },

    #[error("no acknowledgement for parameter {0}, pending value expired")]
    PendingExpired(String),
}

impl ParameterError {
    pub fn name(&self) -> &str {
        match self {
            ParameterError::Rejected { name, .. }
            | ParameterError::KindMismatch { name, .. }
            | ParameterError::OutOfRange { name, .. } => name,
            ParameterError::Unknown(name)
            | ParameterError::ReadOnly(name)
            | ParameterError::PendingExpired(name) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors: Vec<Error> = vec![
            ConnectionError::Timeout(Duration::from_secs(3)).into(),
            DecodeError::UnknownPps(4).into(),
            StorageError::WriterFailed.into(),
            ParameterError::Unknown("zoom".to_string()).into(),
            Error::SessionClosed,
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_parameter_error_name() {
        let error = ParameterError::KindMismatch {
            name: "gain".to_string(),
            expected: ParameterKind::Number,
            actual: ParameterKind::Bool,
        };
        assert_eq!(error.name(), "gain");
        assert_eq!(ParameterError::PendingExpired("iso".to_string()).name(), "iso");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::Other, "disk full");
        let storage: StorageError = io_error.into();
        let error: Error = storage.into();

        match error {
            Error::Storage(StorageError::Io(_)) => {}
            other => panic!("Expected storage IO error, got {:?}", other),
        }
    }
}
