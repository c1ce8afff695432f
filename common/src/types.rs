use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// 传感器身份（由发现层产生，发现后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorIdentity {
    /// 远端主机地址（QUIC端点）
    pub address: SocketAddr,
    /// 传感器唯一ID
    pub sensor_id: String,
    /// 可读名称
    pub name: String,
    /// 能力标签
    pub capabilities: Vec<Capability>,
}

impl SensorIdentity {
    pub fn new(
        address: SocketAddr,
        sensor_id: impl Into<String>,
        name: impl Into<String>,
        capabilities: Vec<Capability>,
    ) -> Self {
        Self {
            address,
            sensor_id: sensor_id.into(),
            name: name.into(),
            capabilities,
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}@{})", self.name, self.sensor_id, self.address)
    }
}

/// 能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Video,
    Audio,
    Imu,
    Gaze,
    Annotation,
    Event,
    Hardware,
    #[serde(other)]
    Other,
}

/// 参数值（键由传感器定义，编译期未知）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Number(f64),
    Bool(bool),
    Enum(String),
    Text(String),
}

impl ParameterValue {
    pub fn kind(&self) -> ParameterKind {
        match self {
            ParameterValue::Number(_) => ParameterKind::Number,
            ParameterValue::Bool(_) => ParameterKind::Bool,
            ParameterValue::Enum(_) => ParameterKind::Enum,
            ParameterValue::Text(_) => ParameterKind::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Enum(v) | ParameterValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Number(v) => write!(f, "{}", v),
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Enum(v) => write!(f, "<{}>", v),
            ParameterValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Number,
    Bool,
    Enum,
    Text,
}

/// 参数描述（设备随参数值一起推送）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub caption: String,
    pub kind: ParameterKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    /// 枚举选项（仅Enum类型）
    pub options: Vec<String>,
    pub default: Option<ParameterValue>,
    pub readonly: bool,
}

impl ParameterDescriptor {
    pub fn new(caption: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            caption: caption.into(),
            kind,
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
            default: None,
            readonly: false,
        }
    }

    /// 检查取值是否满足描述（类型、范围、枚举选项）
    pub fn accepts(&self, value: &ParameterValue) -> bool {
        if value.kind() != self.kind {
            return false;
        }
        match value {
            ParameterValue::Number(v) => {
                self.min.map_or(true, |min| *v >= min) && self.max.map_or(true, |max| *v <= max)
            }
            ParameterValue::Enum(option) => {
                self.options.is_empty() || self.options.iter().any(|o| o == option)
            }
            _ => true,
        }
    }
}

/// 数据帧载荷格式（数据通道头部的format字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum FrameFormat {
    Mjpeg = 0x10,
    H264 = 0x12,
}

impl FrameFormat {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x10 => Some(FrameFormat::Mjpeg),
            0x12 => Some(FrameFormat::H264),
            _ => None,
        }
    }
}
