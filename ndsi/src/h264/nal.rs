//! NAL单元与跨分片的起始码扫描

use crate::error::DecodeError;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// NAL单元类型（低5位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    SliceNonIdr,
    SliceDataPartA,
    SliceDataPartB,
    SliceDataPartC,
    SliceIdr,
    Sei,
    Sps,
    Pps,
    Aud,
    EndOfSequence,
    EndOfStream,
    Filler,
    SpsExtension,
    Prefix,
    SubsetSps,
    Reserved(u8),
    Other(u8),
}

impl From<u8> for NalType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalType::SliceNonIdr,
            2 => NalType::SliceDataPartA,
            3 => NalType::SliceDataPartB,
            4 => NalType::SliceDataPartC,
            5 => NalType::SliceIdr,
            6 => NalType::Sei,
            7 => NalType::Sps,
            8 => NalType::Pps,
            9 => NalType::Aud,
            10 => NalType::EndOfSequence,
            11 => NalType::EndOfStream,
            12 => NalType::Filler,
            13 => NalType::SpsExtension,
            14 => NalType::Prefix,
            15 => NalType::SubsetSps,
            n @ 16..=18 => NalType::Reserved(n),
            n => NalType::Other(n),
        }
    }
}

impl NalType {
    /// 编码条带（VCL）
    pub fn is_vcl(&self) -> bool {
        matches!(
            self,
            NalType::SliceNonIdr
                | NalType::SliceDataPartA
                | NalType::SliceDataPartB
                | NalType::SliceDataPartC
                | NalType::SliceIdr
        )
    }

    /// 出现在VCL之后即开启新访问单元的类型（7.4.1.2.3）
    pub fn starts_access_unit(&self) -> bool {
        matches!(
            self,
            NalType::Aud
                | NalType::Sps
                | NalType::Pps
                | NalType::Sei
                | NalType::Prefix
                | NalType::SubsetSps
                | NalType::Reserved(_)
        )
    }
}

/// 不含起始码的NAL单元（首字节为NAL头）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    data: Bytes,
}

impl NalUnit {
    pub fn new(data: impl Into<Bytes>) -> Option<Self> {
        let data = data.into();
        if data.is_empty() {
            None
        } else {
            Some(Self { data })
        }
    }

    pub fn header(&self) -> u8 {
        self.data[0]
    }

    pub fn nal_type(&self) -> NalType {
        NalType::from(self.header())
    }

    pub fn type_code(&self) -> u8 {
        self.header() & 0x1F
    }

    pub fn ref_idc(&self) -> u8 {
        (self.header() >> 5) & 0x03
    }

    pub fn forbidden_bit(&self) -> bool {
        self.header() & 0x80 != 0
    }

    /// NAL头之后的EBSP载荷
    pub fn payload(&self) -> &[u8] {
        &self.data[1..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// 扫描出的NAL及其首字节到达时所在分片的时间戳
#[derive(Debug, Clone)]
pub struct ScannedNal {
    pub unit: NalUnit,
    pub timestamp: f64,
}

/// 查找三字节起始码 `00 00 01`
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < 3 {
        return None;
    }
    (from..data.len() - 2).find(|&i| data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1)
}

/// 拆分完整的Annex B字节流
pub fn split_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut units = Vec::new();
    let Some(mut start) = find_start_code(data, 0) else {
        return units;
    };

    loop {
        let payload_start = start + 3;
        let next = find_start_code(data, payload_start);
        let end = next.unwrap_or(data.len());
        if let Some(unit) = NalUnit::new(Bytes::copy_from_slice(trim_trailing_zeros(&data[payload_start..end]))) {
            units.push(unit);
        }
        match next {
            Some(n) => start = n,
            None => break,
        }
    }
    units
}

/// 去除trailing_zero_8bits（以及四字节起始码的前导零）
fn trim_trailing_zeros(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &data[..end]
}

/// 跨分片持续存在的重组缓冲区
///
/// 缓冲区要么为空/仅含尚未确认的前缀字节，要么以起始码开头。
/// 每次追加记录 (绝对偏移, 时间戳)，NAL的时间戳取其起始码所在分片。
pub struct NalScanner {
    buffer: BytesMut,
    /// buffer[0] 在整个字节流中的绝对偏移
    base_offset: u64,
    /// 下一次查找结束起始码的位置（避免重复扫描）
    scan_from: usize,
    marks: VecDeque<(u64, f64)>,
    max_buffer_size: usize,
}

impl NalScanner {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            base_offset: 0,
            scan_from: 3,
            marks: VecDeque::new(),
            max_buffer_size,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// 追加一个分片的载荷，返回已完整的NAL单元
    pub fn push(&mut self, data: &[u8], timestamp: f64) -> Result<Vec<ScannedNal>, DecodeError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }

        self.marks
            .push_back((self.base_offset + self.buffer.len() as u64, timestamp));
        self.buffer.extend_from_slice(data);

        let mut units = Vec::new();
        loop {
            // 对齐到起始码
            match find_start_code(&self.buffer, 0) {
                Some(0) => {}
                Some(garbage) => {
                    tracing::debug!("Discarding {} bytes before start code", garbage);
                    self.advance(garbage);
                }
                None => {
                    // 保留可能是被拆开的起始码前缀
                    let keep = self.buffer.len().min(2);
                    let drop = self.buffer.len() - keep;
                    self.advance(drop);
                    break;
                }
            }

            let from = self.scan_from.max(3);
            match find_start_code(&self.buffer, from) {
                Some(next) => {
                    let timestamp = self.timestamp_at(self.base_offset);
                    let nal = trim_trailing_zeros(&self.buffer[3..next]);
                    if let Some(unit) = NalUnit::new(Bytes::copy_from_slice(nal)) {
                        units.push(ScannedNal { unit, timestamp });
                    }
                    self.advance(next);
                }
                None => {
                    self.scan_from = self.buffer.len().saturating_sub(2).max(3);
                    break;
                }
            }
        }

        if self.buffer.len() > self.max_buffer_size {
            let limit = self.max_buffer_size;
            self.clear();
            return Err(DecodeError::BufferOverflow { limit });
        }

        Ok(units)
    }

    /// 访问单元边界或冲刷：缓冲区剩余部分即最后一个完整NAL
    /// 最后一个NAL已到达的部分（其结束位置要等下一个起始码）
    pub fn pending(&self) -> Option<&[u8]> {
        if self.buffer.len() > 3 && self.buffer.starts_with(&[0, 0, 1]) {
            Some(&self.buffer[3..])
        } else {
            None
        }
    }

    pub fn finish(&mut self) -> Option<ScannedNal> {
        let result = if self.buffer.len() > 3 && self.buffer.starts_with(&[0, 0, 1]) {
            let timestamp = self.timestamp_at(self.base_offset);
            NalUnit::new(Bytes::copy_from_slice(trim_trailing_zeros(&self.buffer[3..])))
                .map(|unit| ScannedNal { unit, timestamp })
        } else {
            None
        };

        let len = self.buffer.len();
        self.advance(len);
        result
    }

    /// 丢弃全部重组状态
    pub fn clear(&mut self) {
        let len = self.buffer.len();
        self.advance(len);
        self.marks.clear();
    }

    fn advance(&mut self, count: usize) {
        self.buffer.advance(count);
        self.base_offset += count as u64;
        self.scan_from = 3;

        // 只保留覆盖当前缓冲区起点的最后一个标记
        while self.marks.len() > 1 && self.marks[1].0 <= self.base_offset {
            self.marks.pop_front();
        }
    }

    fn timestamp_at(&self, offset: u64) -> f64 {
        self.marks
            .iter()
            .rev()
            .find(|(start, _)| *start <= offset)
            .or_else(|| self.marks.front())
            .map_or(0.0, |(_, ts)| *ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(units: &[ScannedNal]) -> Vec<u8> {
        units.iter().map(|n| n.unit.type_code()).collect()
    }

    #[test]
    fn test_nal_type_classification() {
        assert!(NalType::from(0x65).is_vcl());
        assert!(NalType::from(0x41).is_vcl());
        assert!(!NalType::from(0x67).is_vcl());
        assert!(NalType::from(0x09).starts_access_unit());
        assert!(!NalType::from(0x0C).starts_access_unit());
        assert_eq!(NalType::from(0x6A), NalType::EndOfSequence);
    }

    #[test]
    fn test_split_annex_b() {
        let stream = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0xCE, 0, 0, 1, 0x65, 0x88];
        let units = split_annex_b(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].as_bytes(), &[0x67, 0x42]);
        assert_eq!(units[1].as_bytes(), &[0x68, 0xCE]);
        assert_eq!(units[2].nal_type(), NalType::SliceIdr);
    }

    #[test]
    fn test_start_code_split_across_chunks() {
        let mut scanner = NalScanner::new(1024);

        let first = scanner.push(&[0, 0, 0, 1, 0x67, 0x42, 0x00], 1.0).unwrap();
        assert!(first.is_empty());

        let second = scanner.push(&[0x00, 0x01, 0x68, 0xCE, 0x00, 0x00], 2.0).unwrap();
        assert_eq!(types(&second), vec![7]);
        assert_eq!(second[0].unit.as_bytes(), &[0x67, 0x42]);
        assert_eq!(second[0].timestamp, 1.0);

        let third = scanner.push(&[0x01, 0x65, 0x88], 3.0).unwrap();
        assert_eq!(types(&third), vec![8]);
        // PPS起始码的首字节是第一个分片的最后一个字节
        assert_eq!(third[0].timestamp, 1.0);

        let last = scanner.finish().unwrap();
        assert_eq!(last.unit.as_bytes(), &[0x65, 0x88]);
        assert_eq!(last.timestamp, 2.0);
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_leading_garbage_is_dropped() {
        let mut scanner = NalScanner::new(1024);
        let units = scanner
            .push(&[0xAA, 0xBB, 0, 0, 1, 0x09, 0xF0, 0, 0, 1, 0x67], 0.5)
            .unwrap();
        assert_eq!(types(&units), vec![9]);
    }

    #[test]
    fn test_overflow() {
        let mut scanner = NalScanner::new(16);
        let mut data = vec![0, 0, 1, 0x65];
        data.extend(std::iter::repeat(0x55).take(32));

        assert_eq!(
            scanner.push(&data, 0.0).unwrap_err(),
            DecodeError::BufferOverflow { limit: 16 }
        );
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_data_without_start_code_keeps_prefix() {
        let mut scanner = NalScanner::new(1024);
        assert!(scanner.push(&[0x12, 0x34, 0x00, 0x00], 0.0).unwrap().is_empty());
        assert_eq!(scanner.buffered(), 2);

        let units = scanner.push(&[0x01, 0x67, 0x42, 0, 0, 1, 0x68], 1.0).unwrap();
        assert_eq!(types(&units), vec![7]);
        // 起始码首字节在第一个分片中
        assert_eq!(units[0].timestamp, 0.0);
    }
}
