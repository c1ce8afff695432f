use crate::error::ProtocolError;
use crate::types::FrameFormat;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// 数据通道头部长度（小端）：
/// format u32 | width u32 | height u32 | sequence u32 | timestamp f64 | data_length u32 | flags u32
pub const CHUNK_HEADER_LEN: usize = 32;

/// 单个分片默认上限（8MB）
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// 分片标志位
#[allow(non_snake_case)]
pub mod ChunkFlags {
    /// 分片在访问单元边界结束
    pub const ACCESS_UNIT_END: u32 = 0b0000_0001;
    /// 分片包含关键帧数据（仅提示）
    pub const KEYFRAME: u32 = 0b0000_0010;
}

/// 数据分片头部
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHeader {
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: f64,
    pub data_length: u32,
    pub flags: u32,
}

impl ChunkHeader {
    pub fn frame_format(&self) -> Option<FrameFormat> {
        FrameFormat::from_u32(self.format)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    fn read_from(mut buf: &[u8]) -> Self {
        Self {
            format: buf.get_u32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            sequence: buf.get_u32_le(),
            timestamp: buf.get_f64_le(),
            data_length: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        }
    }

    fn write_to(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.format);
        dst.put_u32_le(self.width);
        dst.put_u32_le(self.height);
        dst.put_u32_le(self.sequence);
        dst.put_f64_le(self.timestamp);
        dst.put_u32_le(self.data_length);
        dst.put_u32_le(self.flags);
    }
}

/// 线路上的数据分片
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

impl DataChunk {
    pub fn h264(sequence: u32, timestamp: f64, payload: impl Into<Bytes>, flags: u32) -> Self {
        let payload = payload.into();
        Self {
            header: ChunkHeader {
                format: FrameFormat::H264 as u32,
                width: 0,
                height: 0,
                sequence,
                timestamp,
                data_length: payload.len() as u32,
                flags,
            },
            payload,
        }
    }
}

/// 数据通道编解码器（头部 + 定长载荷）
#[derive(Debug, Clone)]
pub struct ChunkCodec {
    max_chunk_size: usize,
}

impl ChunkCodec {
    pub fn new() -> Self {
        Self::with_max_chunk_size(DEFAULT_MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk_size(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkCodec {
    type Item = DataChunk;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DataChunk>, ProtocolError> {
        if src.len() < CHUNK_HEADER_LEN {
            src.reserve(CHUNK_HEADER_LEN - src.len());
            return Ok(None);
        }

        let header = ChunkHeader::read_from(&src[..CHUNK_HEADER_LEN]);
        let data_length = header.data_length as usize;
        if data_length > self.max_chunk_size {
            return Err(ProtocolError::ChunkTooLarge {
                size: data_length,
                limit: self.max_chunk_size,
            });
        }

        let total = CHUNK_HEADER_LEN + data_length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(CHUNK_HEADER_LEN);
        let payload = src.split_to(data_length).freeze();
        Ok(Some(DataChunk { header, payload }))
    }
}

impl Encoder<DataChunk> for ChunkCodec {
    type Error = ProtocolError;

    fn encode(&mut self, chunk: DataChunk, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if chunk.payload.len() > self.max_chunk_size {
            return Err(ProtocolError::ChunkTooLarge {
                size: chunk.payload.len(),
                limit: self.max_chunk_size,
            });
        }

        let mut header = chunk.header;
        header.data_length = chunk.payload.len() as u32;

        dst.reserve(CHUNK_HEADER_LEN + chunk.payload.len());
        header.write_to(dst);
        dst.extend_from_slice(&chunk.payload);
        Ok(())
    }
}
