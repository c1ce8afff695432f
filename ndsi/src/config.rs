use crate::error::{Error, Result};
use crate::frame::PixelFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 库配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NdsiConfig {
    pub session: SessionConfig,
    pub decoder: DecoderConfig,
    pub recorder: RecorderConfig,
    pub discovery: DiscoveryConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 未确认的参数设置在此时长后回退
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub pending_timeout: Duration,

    /// 连续畸形控制消息上限，超过则视为连接错误
    pub max_protocol_errors: u32,

    /// 握手超时（Hello -> Welcome）
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub handshake_timeout: Duration,

    /// 关闭时等待工作线程的上限
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub shutdown_timeout: Duration,

    /// 解码器输入队列容量（分片）
    pub chunk_queue: usize,

    /// 输出帧队列容量
    pub frame_queue: usize,

    /// 事件广播容量
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// 纯Rust校验，按访问单元输出H.264帧
    Passthrough,
    /// libavcodec解码为YUV420P（需要`ffmpeg`特性）
    Ffmpeg,
}

impl FromStr for CodecKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" => Ok(CodecKind::Passthrough),
            "ffmpeg" => Ok(CodecKind::Ffmpeg),
            other => Err(Error::Config(format!("unknown codec: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: CodecKind,

    /// 重组缓冲区上限，溢出按不连续处理
    pub max_buffer_size: usize,

    /// 解码输出的像素格式：`Gray8`、`Yuv420p` 或 `Bgr24`（MJPEG与FFmpeg适配器）
    pub pixel_format: PixelFormat,

    /// 为 false 时JPEG图像原样输出为 `Mjpeg` 帧
    pub decode_mjpeg: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// 写入队列容量，满时丢弃分片并等待下一个关键帧
    pub queue_capacity: usize,

    /// fMP4时间刻度
    pub timescale: u32,

    /// 写出 `<stem>_timestamps.bin`
    pub write_timestamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub bind_address: String,
    pub beacon_port: u16,

    /// 超过此时长未收到信标的传感器视为消失
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub expiry: Duration,

    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub connect_timeout: Duration,

    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub idle_timeout: Duration,

    #[serde(with = "crate::serde_helpers::duration_ms")]
    pub keep_alive_interval: Duration,

    /// TLS SNI（设备使用自签名证书）
    pub server_name: String,

    pub max_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(2),
            max_protocol_errors: 3,
            handshake_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_millis(500),
            chunk_queue: 256,
            frame_queue: 32,
            event_capacity: 256,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Passthrough,
            max_buffer_size: 4 * 1024 * 1024, // 4MB
            pixel_format: PixelFormat::Bgr24,
            decode_mjpeg: true,
        }
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 512,
            timescale: 90_000,
            write_timestamps: true,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            beacon_port: common::DEFAULT_BEACON_PORT,
            expiry: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(2),
            server_name: "localhost".to_string(),
            max_chunk_size: common::DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

impl NdsiConfig {
    /// 从TOML文件加载（缺省字段取默认值），再应用环境变量覆盖
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// 应用 `NDSI_*` 环境变量
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NDSI_PENDING_TIMEOUT_MS") {
            self.session.pending_timeout = Duration::from_millis(parse_env("NDSI_PENDING_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("NDSI_MAX_PROTOCOL_ERRORS") {
            self.session.max_protocol_errors = parse_env("NDSI_MAX_PROTOCOL_ERRORS", &v)?;
        }
        if let Some(v) = lookup("NDSI_CODEC") {
            self.decoder.codec = v.parse()?;
        }
        if let Some(v) = lookup("NDSI_BEACON_PORT") {
            self.discovery.beacon_port = parse_env("NDSI_BEACON_PORT", &v)?;
        }
        if let Some(v) = lookup("NDSI_CONNECT_TIMEOUT_MS") {
            self.transport.connect_timeout = Duration::from_millis(parse_env("NDSI_CONNECT_TIMEOUT_MS", &v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.pending_timeout.is_zero() {
            return Err(Error::Config("Pending timeout must be greater than 0".to_string()));
        }

        if self.session.chunk_queue == 0 || self.session.frame_queue == 0 || self.session.event_capacity == 0 {
            return Err(Error::Config("Session queue capacities must be greater than 0".to_string()));
        }

        // 缓冲区至少能容纳一个起始码和NAL头
        if self.decoder.max_buffer_size < 1024 {
            return Err(Error::Config("Decoder buffer must be at least 1024 bytes".to_string()));
        }

        if self.recorder.queue_capacity == 0 {
            return Err(Error::Config("Recorder queue capacity must be greater than 0".to_string()));
        }

        if self.recorder.timescale == 0 {
            return Err(Error::Config("Recorder timescale must be greater than 0".to_string()));
        }

        if self.discovery.event_capacity == 0 {
            return Err(Error::Config("Discovery event capacity must be greater than 0".to_string()));
        }

        if self.transport.server_name.is_empty() {
            return Err(Error::Config("TLS server name cannot be empty".to_string()));
        }

        if self.decoder.pixel_format.is_compressed() {
            return Err(Error::Config(format!(
                "Decoder pixel format must be raw pixels, got {:?}",
                self.decoder.pixel_format
            )));
        }

        if self.decoder.codec == CodecKind::Ffmpeg && !cfg!(feature = "ffmpeg") {
            return Err(Error::Config(
                "codec = \"ffmpeg\" requires the `ffmpeg` feature".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: {}", key, value)))
}
