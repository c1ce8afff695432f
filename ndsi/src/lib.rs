//! NDSI - 网络设备传感器接口
//!
//! 发现局域网内的传感器主机，控制其采集参数，接收并解码H.264视频流，可选录像。

pub mod codec;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod h264;
pub mod network;
pub mod sensor;
pub mod serde_helpers;
pub mod writer;

pub use config::{CodecKind, NdsiConfig};
pub use decoder::{BitstreamDecoder, DecodeOutput};
pub use error::{ConnectionError, DecodeError, Error, ParameterError, Result, StorageError};
pub use frame::{CompressedChunk, FrameBuffer, PixelFormat};
pub use network::{
    BeaconDiscovery, Connector, Discovery, DiscoveryEvent, Network, QuicConnector, StaticDiscovery,
};
pub use sensor::{FrameStream, ParameterSet, SensorSession, SessionChannels, SessionEvent, SessionState};
pub use writer::{RecordedUnit, Recorder, RecordingReader, RecordingSummary, StreamWriter};

pub use common::{Capability, ParameterDescriptor, ParameterKind, ParameterValue, SensorIdentity};
