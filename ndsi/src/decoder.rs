//! 码流解码器
//!
//! 负责跨分片重组、访问单元划分、参数集跟踪、损坏隔离与不连续恢复；
//! 具体像素解码交给 [`Codec`] 适配器。

use crate::codec::{create_codec, pixels, Codec, Picture, PassthroughCodec};
use crate::config::DecoderConfig;
use crate::error::{DecodeError, Result};
use crate::frame::{CompressedChunk, FrameBuffer, PixelFormat};
use crate::h264::{AccessUnit, AccessUnitAssembler, NalScanner, NalUnit, ParameterSets, ScannedNal, SliceHeader};
use common::FrameFormat;
use tracing::{debug, warn};

/// 一次 `feed`/`flush` 的结果
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// 按完成顺序输出的帧
    pub frames: Vec<FrameBuffer>,
    /// 被丢弃的访问单元
    pub warnings: Vec<DecodeError>,
    /// 检测到不连续，需要请求设备发送关键帧
    pub keyframe_requested: bool,
}

impl DecodeOutput {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.warnings.is_empty() && !self.keyframe_requested
    }

    /// 合并多次调用的输出
    pub fn extend(&mut self, other: DecodeOutput) {
        self.frames.extend(other.frames);
        self.warnings.extend(other.warnings);
        self.keyframe_requested |= other.keyframe_requested;
    }
}

/// 重同步状态：不连续后必须先看到新的SPS、PPS和IDR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sync {
    Locked,
    AwaitingKeyframe,
}

/// 码流解码器（单线程所有，由解码工作线程独占）
pub struct BitstreamDecoder {
    scanner: NalScanner,
    assembler: AccessUnitAssembler,
    params: ParameterSets,
    codec: Box<dyn Codec>,
    sync: Sync,
    last_sequence: Option<u32>,
    next_index: u64,
    /// JPEG解码目标；None 时原样输出
    mjpeg_output: Option<PixelFormat>,
}

impl BitstreamDecoder {
    pub fn new(config: &DecoderConfig) -> Result<Self> {
        let decoder = Self::with_codec(create_codec(config)?, config.max_buffer_size);
        Ok(decoder.with_mjpeg_output(config.decode_mjpeg.then_some(config.pixel_format)))
    }

    pub fn with_codec(codec: Box<dyn Codec>, max_buffer_size: usize) -> Self {
        debug!("Bitstream decoder using {} codec", codec.name());
        Self {
            scanner: NalScanner::new(max_buffer_size),
            assembler: AccessUnitAssembler::new(),
            params: ParameterSets::new(),
            codec,
            sync: Sync::AwaitingKeyframe,
            last_sequence: None,
            next_index: 0,
            mjpeg_output: Some(PixelFormat::Bgr24),
        }
    }

    pub fn with_mjpeg_output(mut self, output: Option<PixelFormat>) -> Self {
        self.mjpeg_output = output;
        self
    }

    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    /// 已输出的帧数
    pub fn frames_emitted(&self) -> u64 {
        self.next_index
    }

    pub fn parameter_sets(&self) -> &ParameterSets {
        &self.params
    }

    /// 输入一个分片
    pub fn feed(&mut self, chunk: &CompressedChunk) -> DecodeOutput {
        let mut out = DecodeOutput::default();

        if let Some(last) = self.last_sequence {
            let expected = last.wrapping_add(1);
            if chunk.sequence != expected {
                warn!(
                    "Sequence gap: expected {}, got {}; discarding partial state",
                    expected, chunk.sequence
                );
                self.discontinuity(&mut out);
            }
        }
        self.last_sequence = Some(chunk.sequence);

        match chunk.format {
            FrameFormat::Mjpeg => {
                self.emit_jpeg(chunk, &mut out);
                return out;
            }
            FrameFormat::H264 => {}
        }

        match self.scanner.push(&chunk.payload, chunk.timestamp) {
            Ok(nals) => {
                for nal in nals {
                    self.push_nal(nal, &mut out);
                }
            }
            Err(e) => {
                warn!("Reassembly failed: {}", e);
                out.warnings.push(e);
                self.discontinuity(&mut out);
            }
        }

        if chunk.is_access_unit_end() {
            self.complete_pending(&mut out);
        } else {
            // 下一幅图像的首个条带已开始到达，当前访问单元无需再等
            let early = self
                .scanner
                .pending()
                .and_then(|prefix| self.assembler.complete_before(prefix));
            if let Some(au) = early {
                self.decode_unit(au, &mut out);
            }
        }

        out
    }

    /// 完成缓冲中的访问单元并取出适配器缓存的图像；参数集保留
    pub fn flush(&mut self) -> DecodeOutput {
        let mut out = DecodeOutput::default();
        self.complete_pending(&mut out);

        match self.codec.flush() {
            Ok(pictures) => {
                for picture in pictures {
                    self.emit(picture, &mut out);
                }
            }
            Err(e) => out.warnings.push(e),
        }

        // 停止后恢复时序号重新开始计算
        self.last_sequence = None;
        out
    }

    /// 丢弃全部状态（帧序号保持单调）
    pub fn reset(&mut self) {
        self.scanner.clear();
        self.assembler.clear();
        self.params.clear();
        self.codec.reset();
        self.sync = Sync::AwaitingKeyframe;
        self.last_sequence = None;
    }

    fn discontinuity(&mut self, out: &mut DecodeOutput) {
        let sequence = self.last_sequence;
        self.reset();
        self.last_sequence = sequence;
        out.keyframe_requested = true;
    }

    fn complete_pending(&mut self, out: &mut DecodeOutput) {
        if let Some(nal) = self.scanner.finish() {
            self.push_nal(nal, out);
        }
        if let Some(au) = self.assembler.finish() {
            self.decode_unit(au, out);
        }
    }

    fn push_nal(&mut self, nal: ScannedNal, out: &mut DecodeOutput) {
        if let Some(au) = self.assembler.push(nal.unit, nal.timestamp) {
            self.decode_unit(au, out);
        }
    }

    fn decode_unit(&mut self, au: AccessUnit, out: &mut DecodeOutput) {
        if let Err(e) = self.check_unit(&au) {
            warn!("Dropping access unit at {:.3}s: {}", au.timestamp, e);
            out.warnings.push(e);
            return;
        }

        // 仅含参数集/SEI的访问单元只更新状态
        if !au.has_vcl() {
            return;
        }

        if self.sync == Sync::AwaitingKeyframe {
            if !(self.params.has_sps() && self.params.has_pps() && au.is_keyframe()) {
                debug!("Waiting for parameter sets and IDR, skipping access unit");
                return;
            }
            debug!("Resynchronized on IDR at {:.3}s", au.timestamp);
            self.sync = Sync::Locked;
        }

        match self.codec.decode(&au, &self.params) {
            Ok(pictures) => {
                for picture in pictures {
                    self.emit(picture, out);
                }
            }
            Err(e) => {
                warn!("{} codec rejected access unit: {}", self.codec.name(), e);
                out.warnings.push(e);
            }
        }
    }

    /// 结构校验：禁止位、参数集、条带头
    fn check_unit(&mut self, au: &AccessUnit) -> std::result::Result<(), DecodeError> {
        if let Some(bad) = au.nals.iter().find(|n| n.forbidden_bit()) {
            return Err(DecodeError::ForbiddenBit { nal_type: bad.type_code() });
        }

        for nal in &au.nals {
            self.params.update(nal)?;
        }

        if self.sync == Sync::Locked {
            for nal in au.vcl_units() {
                check_slice(nal, &self.params)?;
            }
        }
        Ok(())
    }

    fn emit(&mut self, picture: Picture, out: &mut DecodeOutput) {
        let frame = FrameBuffer {
            data: picture.data,
            width: picture.width,
            height: picture.height,
            format: picture.format,
            timestamp: picture.timestamp,
            index: self.next_index,
            keyframe: picture.keyframe,
        };
        debug!(
            "Frame #{} {}x{} at {:.3}s{}",
            frame.index,
            frame.width,
            frame.height,
            frame.timestamp,
            if frame.keyframe { " (key)" } else { "" }
        );
        self.next_index += 1;
        out.frames.push(frame);
    }

    /// MJPEG分片各自是完整图像，不经重组
    fn emit_jpeg(&mut self, chunk: &CompressedChunk, out: &mut DecodeOutput) {
        if chunk.payload.len() < 4 || chunk.payload[..2] != [0xFF, 0xD8] {
            out.warnings.push(DecodeError::Codec("MJPEG chunk without SOI marker".to_string()));
            return;
        }

        let picture = match self.mjpeg_output {
            Some(format) => match pixels::decode_jpeg(&chunk.payload, format) {
                Ok(image) => Picture {
                    data: image.data,
                    width: image.width,
                    height: image.height,
                    format,
                    timestamp: chunk.timestamp,
                    keyframe: true,
                },
                Err(e) => {
                    warn!("Dropping JPEG chunk {}: {}", chunk.sequence, e);
                    out.warnings.push(e);
                    return;
                }
            },
            None => Picture {
                data: chunk.payload.clone(),
                width: chunk.width,
                height: chunk.height,
                format: PixelFormat::Mjpeg,
                timestamp: chunk.timestamp,
                keyframe: true,
            },
        };
        self.emit(picture, out);
    }
}

impl Default for BitstreamDecoder {
    fn default() -> Self {
        let config = DecoderConfig::default();
        Self::with_codec(Box::new(PassthroughCodec::new()), config.max_buffer_size)
    }
}

fn check_slice(nal: &NalUnit, params: &ParameterSets) -> std::result::Result<(), DecodeError> {
    let header = SliceHeader::parse(nal)?;
    params.resolve(&header)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ChunkFlags;

    const SPS: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];
    const IDR: [u8; 5] = [0x65, 0x88, 0x84, 0x21, 0xA0];
    const P: [u8; 4] = [0x41, 0x9A, 0x21, 0x40];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_keyframe_then_p_frame() {
        let mut decoder = BitstreamDecoder::default();
        let stream = annex_b(&[&SPS, &PPS, &IDR, &P]);
        let chunk = CompressedChunk::new(0, 1.0, stream).with_flags(ChunkFlags::ACCESS_UNIT_END);

        let out = decoder.feed(&chunk);
        assert!(out.warnings.is_empty());
        assert_eq!(out.frames.len(), 2);
        assert!(out.frames[0].keyframe);
        assert!(!out.frames[1].keyframe);
        assert_eq!(out.frames[1].index, 1);
    }

    #[test]
    fn test_next_picture_start_completes_unit() {
        let mut decoder = BitstreamDecoder::default();
        let stream = annex_b(&[&SPS, &PPS, &IDR, &P, &P]);
        let out = decoder.feed(&CompressedChunk::new(0, 2.0, stream));

        // 最后一个P帧的结束位置未知，留在缓冲中
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[0].index, 0);
        assert_eq!(out.frames[1].index, 1);
        assert!(out.frames[0].timestamp <= out.frames[1].timestamp);

        let out = decoder.flush();
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].index, 2);
    }

    #[test]
    fn test_frames_wait_for_keyframe() {
        let mut decoder = BitstreamDecoder::default();
        let out = decoder.feed(&CompressedChunk::new(0, 0.0, annex_b(&[&P])).end_of_access_unit());
        assert!(out.is_empty());

        let out = decoder.feed(&CompressedChunk::new(1, 0.1, annex_b(&[&SPS, &PPS, &IDR])).end_of_access_unit());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].index, 0);
    }

    #[test]
    fn test_forbidden_bit_drops_unit() {
        let mut decoder = BitstreamDecoder::default();
        decoder.feed(&CompressedChunk::new(0, 0.0, annex_b(&[&SPS, &PPS, &IDR])).end_of_access_unit());

        let corrupt = [0xC1, 0x9A, 0x21, 0x40];
        let out = decoder.feed(&CompressedChunk::new(1, 0.1, annex_b(&[&corrupt])).end_of_access_unit());
        assert!(out.frames.is_empty());
        assert_eq!(out.warnings, vec![DecodeError::ForbiddenBit { nal_type: 1 }]);

        let out = decoder.feed(&CompressedChunk::new(2, 0.2, annex_b(&[&P])).end_of_access_unit());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].index, 1);
    }

    #[test]
    fn test_sequence_gap_requests_keyframe() {
        let mut decoder = BitstreamDecoder::default();
        decoder.feed(&CompressedChunk::new(10, 0.0, annex_b(&[&SPS, &PPS, &IDR])).end_of_access_unit());

        let out = decoder.feed(&CompressedChunk::new(12, 0.2, annex_b(&[&P])).end_of_access_unit());
        assert!(out.keyframe_requested);
        assert!(out.frames.is_empty());
        assert!(!decoder.parameter_sets().has_sps());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut decoder = BitstreamDecoder::default();
        decoder.feed(&CompressedChunk::new(u32::MAX, 0.0, annex_b(&[&SPS, &PPS, &IDR])).end_of_access_unit());
        let out = decoder.feed(&CompressedChunk::new(0, 0.1, annex_b(&[&P])).end_of_access_unit());
        assert!(!out.keyframe_requested);
        assert_eq!(out.frames.len(), 1);
    }

    #[test]
    fn test_flush_completes_pending_unit() {
        let mut decoder = BitstreamDecoder::default();
        let out = decoder.feed(&CompressedChunk::new(0, 0.0, annex_b(&[&SPS, &PPS, &IDR])));
        assert!(out.frames.is_empty());

        let out = decoder.flush();
        assert_eq!(out.frames.len(), 1);

        // 冲刷后序号不再比较
        let out = decoder.feed(&CompressedChunk::new(100, 1.0, annex_b(&[&P])).end_of_access_unit());
        assert!(!out.keyframe_requested);
        assert_eq!(out.frames.len(), 1);
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([40, 120, 220]));
        let mut out = std::io::Cursor::new(Vec::new());
        image.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_mjpeg_decoded_without_reassembly() {
        let mut decoder = BitstreamDecoder::default();
        let out = decoder.feed(&CompressedChunk::mjpeg(0, 0.5, 32, 16, jpeg(32, 16)));

        assert_eq!(out.frames.len(), 1);
        let frame = &out.frames[0];
        assert_eq!(frame.format, PixelFormat::Bgr24);
        assert_eq!((frame.width, frame.height), (32, 16));
        assert_eq!(Some(frame.data.len()), frame.expected_len());
        assert!(frame.keyframe);

        let out = decoder.feed(&CompressedChunk::mjpeg(1, 0.6, 32, 16, vec![1, 2, 3, 4]));
        assert_eq!(out.warnings.len(), 1);

        // SOI正确但内容损坏
        let out = decoder.feed(&CompressedChunk::mjpeg(2, 0.7, 32, 16, vec![0xFF, 0xD8, 0xFF, 0xD9]));
        assert!(out.frames.is_empty());
        assert!(matches!(out.warnings[..], [DecodeError::Codec(_)]));

        let out = decoder.feed(&CompressedChunk::mjpeg(3, 0.8, 32, 16, jpeg(32, 16)));
        assert_eq!(out.frames[0].index, 1);
    }

    #[test]
    fn test_mjpeg_output_follows_config() {
        let config = DecoderConfig {
            pixel_format: PixelFormat::Gray8,
            ..DecoderConfig::default()
        };
        let mut decoder = BitstreamDecoder::new(&config).unwrap();
        let out = decoder.feed(&CompressedChunk::mjpeg(0, 0.0, 32, 16, jpeg(32, 16)));
        assert_eq!(out.frames[0].format, PixelFormat::Gray8);
        assert_eq!(out.frames[0].luma().map(<[u8]>::len), Some(32 * 16));

        let config = DecoderConfig {
            decode_mjpeg: false,
            ..DecoderConfig::default()
        };
        let mut decoder = BitstreamDecoder::new(&config).unwrap();
        let data = jpeg(32, 16);
        let out = decoder.feed(&CompressedChunk::mjpeg(0, 0.0, 640, 480, data.clone()));
        assert_eq!(out.frames[0].format, PixelFormat::Mjpeg);
        assert_eq!((out.frames[0].width, out.frames[0].height), (640, 480));
        assert_eq!(out.frames[0].data, data);
    }

    #[test]
    fn test_overflow_is_discontinuity() {
        let config = DecoderConfig {
            max_buffer_size: 1024,
            ..Default::default()
        };
        let mut decoder = BitstreamDecoder::new(&config).unwrap();

        let mut huge = vec![0, 0, 0, 1, 0x41];
        huge.extend(std::iter::repeat(0x55).take(4096));
        let out = decoder.feed(&CompressedChunk::new(0, 0.0, huge));

        assert!(out.keyframe_requested);
        assert_eq!(out.warnings, vec![DecodeError::BufferOverflow { limit: 1024 }]);
    }
}
