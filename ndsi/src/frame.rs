use bytes::Bytes;
use common::{ChunkFlags, DataChunk, FrameFormat, ProtocolError};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// 从数据通道收到的压缩分片
///
/// 载荷以引用计数的`Bytes`共享，解码器与录像写入器各持有一份不可变视图。
#[derive(Debug, Clone)]
pub struct CompressedChunk {
    pub payload: Bytes,
    pub sequence: u32,
    /// 设备时间戳（秒）
    pub timestamp: f64,
    pub received_at: SystemTime,
    pub format: FrameFormat,
    /// 头部声明的尺寸（MJPEG使用，H.264以SPS为准）
    pub width: u32,
    pub height: u32,
    pub flags: u32,
}

impl CompressedChunk {
    pub fn new(sequence: u32, timestamp: f64, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sequence,
            timestamp,
            received_at: SystemTime::now(),
            format: FrameFormat::H264,
            width: 0,
            height: 0,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// 标记分片在访问单元边界结束
    pub fn end_of_access_unit(self) -> Self {
        let flags = self.flags | ChunkFlags::ACCESS_UNIT_END;
        self.with_flags(flags)
    }

    pub fn mjpeg(sequence: u32, timestamp: f64, width: u32, height: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            format: FrameFormat::Mjpeg,
            width,
            height,
            ..Self::new(sequence, timestamp, payload)
        }
    }

    /// 由线路分片构造；未知格式返回错误（调用方跳过该分片）
    pub fn from_wire(chunk: DataChunk) -> Result<Self, ProtocolError> {
        let format = chunk
            .header
            .frame_format()
            .ok_or(ProtocolError::UnknownFormat(chunk.header.format))?;

        Ok(Self {
            payload: chunk.payload,
            sequence: chunk.header.sequence,
            timestamp: chunk.header.timestamp,
            received_at: SystemTime::now(),
            format,
            width: chunk.header.width,
            height: chunk.header.height,
            flags: chunk.header.flags,
        })
    }

    pub fn is_access_unit_end(&self) -> bool {
        self.flags & ChunkFlags::ACCESS_UNIT_END != 0
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// 输出帧像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    /// 平面YUV 4:2:0（Y, U, V依次排列）
    Yuv420p,
    Bgr24,
    /// 未解码的H.264访问单元（Annex B）
    H264,
    /// 未解码的JPEG图像
    Mjpeg,
}

impl PixelFormat {
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::H264 | PixelFormat::Mjpeg)
    }
}

/// 解码输出帧，所有权交给调用方
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: f64,
    /// 解码器生命周期内从0单调递增
    pub index: u64,
    pub keyframe: bool,
}

impl FrameBuffer {
    /// 原始像素格式的期望字节数
    pub fn expected_len(&self) -> Option<usize> {
        let pixels = self.width as usize * self.height as usize;
        match self.format {
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Yuv420p => Some(pixels + 2 * ((self.width as usize + 1) / 2) * ((self.height as usize + 1) / 2)),
            PixelFormat::Bgr24 => Some(pixels * 3),
            PixelFormat::H264 | PixelFormat::Mjpeg => None,
        }
    }

    /// 亮度平面（灰度图）
    pub fn luma(&self) -> Option<&[u8]> {
        match self.format {
            PixelFormat::Gray8 | PixelFormat::Yuv420p => {
                let len = self.width as usize * self.height as usize;
                self.data.get(..len)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_wire() {
        let wire = DataChunk::h264(9, 3.5, vec![0, 0, 1, 0x65], ChunkFlags::ACCESS_UNIT_END);
        let chunk = CompressedChunk::from_wire(wire).unwrap();

        assert_eq!(chunk.sequence, 9);
        assert_eq!(chunk.timestamp, 3.5);
        assert_eq!(chunk.format, FrameFormat::H264);
        assert!(chunk.is_access_unit_end());
    }

    #[test]
    fn test_unknown_format() {
        let mut wire = DataChunk::h264(1, 0.0, vec![1, 2, 3], 0);
        wire.header.format = 0x77;

        assert!(matches!(
            CompressedChunk::from_wire(wire),
            Err(ProtocolError::UnknownFormat(0x77))
        ));
    }

    #[test]
    fn test_payload_is_shared() {
        let chunk = CompressedChunk::new(0, 0.0, vec![0u8; 64]);
        let copy = chunk.clone();
        assert_eq!(chunk.payload.as_ptr(), copy.payload.as_ptr());
    }

    #[test]
    fn test_yuv_layout() {
        let frame = FrameBuffer {
            data: Bytes::from(vec![7u8; 6 * 4 * 3 / 2]),
            width: 6,
            height: 4,
            format: PixelFormat::Yuv420p,
            timestamp: 0.0,
            index: 0,
            keyframe: true,
        };

        assert_eq!(frame.expected_len(), Some(36));
        assert_eq!(frame.luma().map(|y| y.len()), Some(24));
        assert!(!frame.format.is_compressed());
    }
}
