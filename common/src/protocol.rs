use crate::error::Result;
use crate::types::*;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// 通道类型（每个QUIC流的第一条消息声明）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChannelKind {
    Control,
    Data,
}

/// 控制请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlRequest {
    pub request_id: u64,
    pub action: ControlAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlAction {
    Get { name: String },
    Set { name: String, value: ParameterValue },
    GetAll,
    ResetAll,
    StartStream,
    StopStream,
    RequestKeyframe,
}

impl ControlAction {
    pub fn parameter_name(&self) -> Option<&str> {
        match self {
            ControlAction::Get { name } | ControlAction::Set { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// 应答状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Rejected,
    UnknownParameter,
}

/// 控制应答
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlReply {
    pub request_id: u64,
    pub name: Option<String>,
    pub value: Option<ParameterValue>,
    pub status: ReplyStatus,
    pub reason: Option<String>,
}

impl ControlReply {
    pub fn ok(request_id: u64, name: Option<String>, value: Option<ParameterValue>) -> Self {
        Self {
            request_id,
            name,
            value,
            status: ReplyStatus::Ok,
            reason: None,
        }
    }

    pub fn rejected(request_id: u64, name: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            name,
            value: None,
            status: ReplyStatus::Rejected,
            reason: Some(reason.into()),
        }
    }

    pub fn unknown(request_id: u64, name: impl Into<String>) -> Self {
        Self {
            request_id,
            name: Some(name.into()),
            value: None,
            status: ReplyStatus::UnknownParameter,
            reason: None,
        }
    }
}

/// 参数更新（握手、推送、GetAll应答中使用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterUpdate {
    pub name: String,
    pub value: ParameterValue,
    pub descriptor: Option<ParameterDescriptor>,
}

/// 控制器 -> 设备
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    Hello {
        sensor_id: String,
        channel: ChannelKind,
    },
    Request(ControlRequest),
}

/// 设备 -> 控制器
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceMessage {
    Welcome {
        sensor_id: String,
        name: String,
        streaming: bool,
        parameters: Vec<ParameterUpdate>,
    },
    Refused {
        reason: String,
    },
    Reply(ControlReply),
    Push(ParameterUpdate),
    StreamStarted,
    StreamStopped,
}

/// 编码控制消息（一条消息对应一个长度分隔帧）
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

/// 解码控制消息
pub fn decode_message<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(frame)?)
}
