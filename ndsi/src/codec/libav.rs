// libavcodec解码适配器
//
// 输入完整访问单元（Annex B），按配置输出 YUV420P、GRAY8 或 BGR24

use super::{Codec, Picture};
use crate::error::DecodeError;
use crate::frame::PixelFormat;
use crate::h264::{AccessUnit, ParameterSets};
use bytes::{BufMut, Bytes, BytesMut};
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg_next as ffmpeg;
use std::collections::HashMap;
use tracing::{debug, info};

/// FFmpeg H.264解码器
pub struct FfmpegCodec {
    decoder: ffmpeg::decoder::Video,
    /// pts -> (时间戳, 是否关键帧)
    pending: HashMap<i64, (f64, bool)>,
    next_pts: i64,
    format: PixelFormat,
}

impl FfmpegCodec {
    pub fn new(format: PixelFormat) -> Result<Self, DecodeError> {
        target_pixel(format)?;
        ffmpeg::init().map_err(codec_error)?;

        let codec = ffmpeg::decoder::find(ffmpeg::codec::Id::H264)
            .ok_or_else(|| DecodeError::Codec("H.264 decoder not available".to_string()))?;

        let decoder = ffmpeg::codec::context::Context::new()
            .decoder()
            .open_as(codec)
            .and_then(|opened| opened.video())
            .map_err(codec_error)?;

        info!("✓ FFmpeg H.264 decoder initialized ({:?} output)", format);

        Ok(Self {
            decoder,
            pending: HashMap::new(),
            next_pts: 0,
            format,
        })
    }

    fn receive(&mut self) -> Result<Vec<Picture>, DecodeError> {
        let mut pictures = Vec::new();
        loop {
            let mut frame = Video::empty();
            match self.decoder.receive_frame(&mut frame) {
                Ok(()) => pictures.push(self.picture(&frame)?),
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => break, // EAGAIN
                Err(e) => return Err(codec_error(e)),
            }
        }
        Ok(pictures)
    }

    fn picture(&mut self, frame: &Video) -> Result<Picture, DecodeError> {
        let (timestamp, keyframe) = frame
            .pts()
            .and_then(|pts| self.pending.remove(&pts))
            .unwrap_or((0.0, frame.is_key()));

        let target = target_pixel(self.format)?;
        let converted;
        let output = if frame.format() == target {
            frame
        } else {
            // 解码器原生格式随profile变化，统一转换到目标格式
            let mut scaler = Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                target,
                frame.width(),
                frame.height(),
                Flags::BILINEAR,
            )
            .map_err(codec_error)?;
            let mut out = Video::new(target, frame.width(), frame.height());
            scaler.run(frame, &mut out).map_err(codec_error)?;
            converted = out;
            &converted
        };

        Ok(Picture {
            data: copy_planes(output, self.format),
            width: output.width(),
            height: output.height(),
            format: self.format,
            timestamp,
            keyframe,
        })
    }
}

impl Codec for FfmpegCodec {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn decode(&mut self, au: &AccessUnit, _params: &ParameterSets) -> Result<Vec<Picture>, DecodeError> {
        let data = au.to_annex_b();
        let mut packet = ffmpeg::Packet::copy(&data);
        packet.set_pts(Some(self.next_pts));
        self.pending.insert(self.next_pts, (au.timestamp, au.is_keyframe()));
        self.next_pts += 1;

        if let Err(e) = self.decoder.send_packet(&packet) {
            self.pending.remove(&(self.next_pts - 1));
            return Err(codec_error(e));
        }

        let pictures = self.receive()?;
        debug!("📦 Decoded {} picture(s) from {} bytes", pictures.len(), data.len());
        Ok(pictures)
    }

    fn flush(&mut self) -> Result<Vec<Picture>, DecodeError> {
        self.decoder.send_eof().map_err(codec_error)?;
        let pictures = self.receive()?;
        // 冲刷后恢复可用状态
        self.decoder.flush();
        self.pending.clear();
        Ok(pictures)
    }

    fn reset(&mut self) {
        self.decoder.flush();
        self.pending.clear();
    }
}

fn target_pixel(format: PixelFormat) -> Result<Pixel, DecodeError> {
    match format {
        PixelFormat::Yuv420p => Ok(Pixel::YUV420P),
        PixelFormat::Gray8 => Ok(Pixel::GRAY8),
        PixelFormat::Bgr24 => Ok(Pixel::BGR24),
        PixelFormat::H264 | PixelFormat::Mjpeg => Err(DecodeError::Codec(format!(
            "FFmpeg cannot output {:?}",
            format
        ))),
    }
}

/// 去除行填充，按平面依次拷贝
fn copy_planes(frame: &Video, format: PixelFormat) -> Bytes {
    let (planes, bytes_per_pixel) = match format {
        PixelFormat::Yuv420p => (3, 1),
        PixelFormat::Bgr24 => (1, 3),
        _ => (1, 1),
    };
    let mut out = BytesMut::new();
    for plane in 0..planes {
        let stride = frame.stride(plane);
        let row_len = frame.plane_width(plane) as usize * bytes_per_pixel;
        let height = frame.plane_height(plane) as usize;
        let data = frame.data(plane);
        for row in 0..height {
            out.put_slice(&data[row * stride..row * stride + row_len]);
        }
    }
    out.freeze()
}

fn codec_error(e: ffmpeg::Error) -> DecodeError {
    DecodeError::Codec(e.to_string())
}
