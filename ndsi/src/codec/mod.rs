//! 解码能力抽象
//!
//! 重组、排序与损坏隔离由 `BitstreamDecoder` 负责，适配器只处理单个完整的访问单元。

mod passthrough;
pub mod pixels;

#[cfg(feature = "ffmpeg")]
mod libav;

pub use passthrough::PassthroughCodec;

#[cfg(feature = "ffmpeg")]
pub use libav::FfmpegCodec;

use crate::config::{CodecKind, DecoderConfig};
use crate::error::{DecodeError, Error, Result};
use crate::frame::PixelFormat;
use crate::h264::{AccessUnit, ParameterSets};
use bytes::Bytes;

/// 适配器输出的图像（帧序号由解码器分配）
#[derive(Debug, Clone, PartialEq)]
pub struct Picture {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: f64,
    pub keyframe: bool,
}

pub trait Codec: Send {
    fn name(&self) -> &'static str;

    /// 解码一个完整的访问单元；重排序的解码器须按显示顺序返回
    fn decode(&mut self, au: &AccessUnit, params: &ParameterSets) -> std::result::Result<Vec<Picture>, DecodeError>;

    /// 输出内部缓存的图像
    fn flush(&mut self) -> std::result::Result<Vec<Picture>, DecodeError>;

    /// 丢弃参考帧与内部状态
    fn reset(&mut self);
}

pub fn create_codec(config: &DecoderConfig) -> Result<Box<dyn Codec>> {
    match config.codec {
        CodecKind::Passthrough => Ok(Box::new(PassthroughCodec::new())),
        #[cfg(feature = "ffmpeg")]
        CodecKind::Ffmpeg => Ok(Box::new(FfmpegCodec::new(config.pixel_format)?)),
        #[cfg(not(feature = "ffmpeg"))]
        CodecKind::Ffmpeg => Err(Error::Config(
            "FFmpeg codec requested but the `ffmpeg` feature is disabled".to_string(),
        )),
    }
}
