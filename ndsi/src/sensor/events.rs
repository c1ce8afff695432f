use super::SessionState;
use crate::error::{DecodeError, ParameterError};
use crate::writer::RecordingSummary;
use common::ParameterValue;
use std::path::PathBuf;

/// 会话事件（与帧流并行的提示信息，慢消费者会丢失旧事件）
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// 损坏的访问单元被丢弃
    DecodeWarning(DecodeError),
    /// 解码器检测到不连续，已向设备请求关键帧
    KeyframeRequested,
    ParameterConfirmed {
        name: String,
        value: ParameterValue,
    },
    ParameterFailed(ParameterError),
    /// 单条畸形控制消息
    ProtocolViolation(String),
    RecordingStarted {
        path: PathBuf,
    },
    RecordingFinished(RecordingSummary),
    /// 录像写入失败，录像已停止，解码不受影响
    StorageFailed {
        path: PathBuf,
        reason: String,
    },
    /// 输出队列已满，帧被丢弃
    FrameDropped {
        index: u64,
    },
    Disconnected {
        reason: String,
    },
}
