// 录像回读：解析本模块写出的分片MP4，恢复 (时间戳, Annex B访问单元) 序列
//
// 未封口（进程中断）的文件可以读出截断点之前的完整分片。

use super::fmp4::BoxType;
use super::timestamps_path;
use crate::error::StorageError;
use bytes::{BufMut, Bytes, BytesMut};
use std::path::Path;
use tracing::{debug, warn};

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS: u32 = 0x000800;
const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// 录像中的一个访问单元
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUnit {
    pub timestamp: f64,
    pub keyframe: bool,
    /// Annex B（4字节起始码）
    pub data: Bytes,
}

#[derive(Debug)]
pub struct RecordingReader {
    units: Vec<RecordedUnit>,
    finalized: bool,
    width: u32,
    height: u32,
    timescale: u32,
}

/// 一个box在缓冲区中的位置
struct BoxRef<'a> {
    kind: u32,
    start: usize,
    payload: &'a [u8],
}

impl RecordingReader {
    /// 读取录像文件及其时间戳旁路文件（若存在）
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;

        let sidecar = timestamps_path(path);
        let timestamps = match std::fs::read(&sidecar) {
            Ok(bytes) => Some(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Self::parse(&data, timestamps)
    }

    /// 解析内存中的录像；没有旁路时间戳时由 tfdt 推算
    pub fn parse(data: &[u8], timestamps: Option<Vec<f64>>) -> Result<Self, StorageError> {
        if data.is_empty() {
            // 未等到关键帧的录像为空文件
            return Ok(Self {
                units: Vec::new(),
                finalized: false,
                width: 0,
                height: 0,
                timescale: 0,
            });
        }

        let boxes = top_level_boxes(data);
        match boxes.first() {
            Some(b) if b.kind == BoxType::Ftyp as u32 => {}
            _ => return Err(StorageError::Malformed("missing ftyp box".to_string())),
        }

        let mut reader = Self {
            units: Vec::new(),
            finalized: false,
            width: 0,
            height: 0,
            timescale: 0,
        };
        let mut decode_times = Vec::new();

        for b in &boxes {
            match b.kind {
                k if k == BoxType::Moov as u32 => reader.read_moov(b.payload)?,
                k if k == BoxType::Moof as u32 => {
                    if reader.timescale == 0 {
                        return Err(StorageError::Malformed("moof before moov".to_string()));
                    }
                    match read_fragment(data, b)? {
                        Some(samples) => {
                            for (decode_time, keyframe, data) in samples {
                                decode_times.push(decode_time);
                                reader.units.push(RecordedUnit {
                                    timestamp: 0.0,
                                    keyframe,
                                    data,
                                });
                            }
                        }
                        None => {
                            debug!("Recording truncated inside a fragment");
                            break;
                        }
                    }
                }
                k if k == BoxType::Mfra as u32 => reader.finalized = true,
                _ => {}
            }
        }

        let timestamps = timestamps.filter(|ts| {
            let usable = ts.len() >= reader.units.len();
            if !usable {
                warn!(
                    "Timestamp sidecar has {} entries for {} units, using tfdt",
                    ts.len(),
                    reader.units.len()
                );
            }
            usable
        });
        for (i, unit) in reader.units.iter_mut().enumerate() {
            unit.timestamp = match &timestamps {
                Some(ts) => ts[i],
                None => decode_times[i] as f64 / reader.timescale as f64,
            };
        }

        Ok(reader)
    }

    pub fn units(&self) -> &[RecordedUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<RecordedUnit> {
        self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// 文件是否带有尾部索引（正常关闭）
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    fn read_moov(&mut self, moov: &[u8]) -> Result<(), StorageError> {
        let trak = child(moov, BoxType::Trak).ok_or_else(|| malformed("moov without trak"))?;

        if let Some(tkhd) = child(trak, BoxType::Tkhd) {
            if tkhd.len() >= 8 {
                let end = tkhd.len();
                self.width = read_u32(tkhd, end - 8) >> 16;
                self.height = read_u32(tkhd, end - 4) >> 16;
            }
        }

        let mdhd = child(trak, BoxType::Mdia)
            .and_then(|mdia| child(mdia, BoxType::Mdhd))
            .ok_or_else(|| malformed("trak without mdhd"))?;
        // version 1: 4字节头 + 两个u64时间
        let offset = if mdhd.first() == Some(&1) { 20 } else { 12 };
        if mdhd.len() < offset + 4 {
            return Err(malformed("short mdhd"));
        }
        self.timescale = read_u32(mdhd, offset);
        if self.timescale == 0 {
            return Err(malformed("zero timescale"));
        }
        Ok(())
    }
}

/// 解析一个moof及其样本；数据被截断时返回 None
fn read_fragment(file: &[u8], moof: &BoxRef<'_>) -> Result<Option<Vec<(u64, bool, Bytes)>>, StorageError> {
    let traf = child(moof.payload, BoxType::Traf).ok_or_else(|| malformed("moof without traf"))?;

    let tfdt = child(traf, BoxType::Tfdt).ok_or_else(|| malformed("traf without tfdt"))?;
    let decode_time = match tfdt.first() {
        Some(1) if tfdt.len() >= 12 => read_u64(tfdt, 4),
        Some(0) if tfdt.len() >= 8 => read_u32(tfdt, 4) as u64,
        _ => return Err(malformed("bad tfdt")),
    };

    let trun = child(traf, BoxType::Trun).ok_or_else(|| malformed("traf without trun"))?;
    if trun.len() < 8 {
        return Err(malformed("short trun"));
    }
    let flags = read_u32(trun, 0) & 0x00FF_FFFF;
    let count = read_u32(trun, 4) as usize;
    let mut pos = 8;

    let mut data_offset = 0i64;
    if flags & TRUN_DATA_OFFSET != 0 {
        data_offset = read_i32_checked(trun, pos)? as i64;
        pos += 4;
    }
    let mut first_flags = None;
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        first_flags = Some(read_u32_checked(trun, pos)?);
        pos += 4;
    }

    let mut samples = Vec::with_capacity(count);
    let mut cursor = moof.start as i64 + data_offset;
    let mut time = decode_time;

    for i in 0..count {
        let mut duration = 0;
        if flags & TRUN_SAMPLE_DURATION != 0 {
            duration = read_u32_checked(trun, pos)?;
            pos += 4;
        }
        if flags & TRUN_SAMPLE_SIZE == 0 {
            return Err(malformed("trun without sample sizes"));
        }
        let size = read_u32_checked(trun, pos)? as usize;
        pos += 4;
        let mut sample_flags = if i == 0 { first_flags.unwrap_or(0) } else { 0 };
        if flags & TRUN_SAMPLE_FLAGS != 0 {
            sample_flags = read_u32_checked(trun, pos)?;
            pos += 4;
        }
        if flags & TRUN_SAMPLE_CTS != 0 {
            pos += 4;
        }

        if cursor < 0 {
            return Err(malformed("negative sample offset"));
        }
        let start = cursor as usize;
        let Some(sample) = file.get(start..start + size) else {
            return Ok(None);
        };
        samples.push((time, sample_flags & SAMPLE_IS_NON_SYNC == 0, avcc_to_annex_b(sample)?));

        cursor += size as i64;
        time += duration as u64;
    }

    Ok(Some(samples))
}

fn avcc_to_annex_b(sample: &[u8]) -> Result<Bytes, StorageError> {
    let mut out = BytesMut::with_capacity(sample.len());
    let mut pos = 0;
    while pos < sample.len() {
        let len = read_u32_checked(sample, pos)? as usize;
        pos += 4;
        let nal = sample
            .get(pos..pos + len)
            .ok_or_else(|| malformed("NAL length exceeds sample"))?;
        out.put_slice(&[0, 0, 0, 1]);
        out.put_slice(nal);
        pos += len;
    }
    Ok(out.freeze())
}

/// 顶层box；遇到截断的box即停止
fn top_level_boxes(data: &[u8]) -> Vec<BoxRef<'_>> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while let Some((kind, header, size)) = box_header(data, pos) {
        let Some(payload) = data.get(pos + header..pos + size) else {
            break;
        };
        boxes.push(BoxRef { kind, start: pos, payload });
        pos += size;
    }
    boxes
}

/// 返回 (类型, 头长度, 总长度)
fn box_header(data: &[u8], pos: usize) -> Option<(u32, usize, usize)> {
    if data.len() < pos + 8 {
        return None;
    }
    let size = read_u32(data, pos) as usize;
    let kind = read_u32(data, pos + 4);
    match size {
        0 => Some((kind, 8, data.len() - pos)),
        1 => {
            if data.len() < pos + 16 {
                return None;
            }
            let large = read_u64(data, pos + 8) as usize;
            (large >= 16).then_some((kind, 16, large))
        }
        n if n >= 8 => Some((kind, 8, n)),
        _ => None,
    }
}

fn child(container: &[u8], kind: BoxType) -> Option<&[u8]> {
    top_level_boxes(container)
        .into_iter()
        .find(|b| b.kind == kind as u32)
        .map(|b| b.payload)
}

fn read_u32(data: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

fn read_u64(data: &[u8], pos: usize) -> u64 {
    ((read_u32(data, pos) as u64) << 32) | read_u32(data, pos + 4) as u64
}

fn read_u32_checked(data: &[u8], pos: usize) -> Result<u32, StorageError> {
    if data.len() < pos + 4 {
        return Err(malformed("unexpected end of box"));
    }
    Ok(read_u32(data, pos))
}

fn read_i32_checked(data: &[u8], pos: usize) -> Result<i32, StorageError> {
    read_u32_checked(data, pos).map(|v| v as i32)
}

fn malformed(what: &str) -> StorageError {
    StorageError::Malformed(what.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::{NalUnit, Pps, Sps};
    use crate::writer::fmp4::{Fmp4Muxer, TrackInfo};

    const SPS: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

    fn muxer() -> Fmp4Muxer {
        let sps = Sps::parse(&NalUnit::new(SPS.to_vec()).unwrap()).unwrap();
        let pps = Pps::parse(&NalUnit::new(PPS.to_vec()).unwrap()).unwrap();
        Fmp4Muxer::new(TrackInfo::new(&sps, &pps, 90_000))
    }

    fn avcc(nal: &[u8]) -> Vec<u8> {
        let mut out = (nal.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(nal);
        out
    }

    /// init + 两个分片（+ 可选尾部）
    fn recording(finalize: bool) -> Vec<u8> {
        let mut muxer = muxer();
        let mut file = muxer.init_segment().to_vec();
        let offset = file.len() as u64;
        file.extend_from_slice(&muxer.fragment(0, 3000, &avcc(&[0x65, 0x88, 0x84, 0x21, 0xA0]), true, offset));
        let offset = file.len() as u64;
        file.extend_from_slice(&muxer.fragment(3000, 3000, &avcc(&[0x41, 0x9A, 0x21, 0x40]), false, offset));
        if finalize {
            file.extend_from_slice(&muxer.trailer());
        }
        file
    }

    #[test]
    fn test_parse_uses_tfdt_without_sidecar() {
        let reader = RecordingReader::parse(&recording(true), None).unwrap();
        assert!(reader.is_finalized());
        assert_eq!(reader.resolution(), (320, 240));
        assert_eq!(reader.timescale(), 90_000);
        assert_eq!(reader.len(), 2);

        let units = reader.units();
        assert!(units[0].keyframe);
        assert!(!units[1].keyframe);
        assert_eq!(units[0].timestamp, 0.0);
        assert!((units[1].timestamp - 3000.0 / 90_000.0).abs() < 1e-9);
        assert_eq!(&units[0].data[..], &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21, 0xA0]);
    }

    #[test]
    fn test_sidecar_timestamps_take_precedence() {
        let reader = RecordingReader::parse(&recording(true), Some(vec![12.5, 12.6])).unwrap();
        assert_eq!(reader.units()[0].timestamp, 12.5);
        assert_eq!(reader.units()[1].timestamp, 12.6);
    }

    #[test]
    fn test_truncated_recording_keeps_complete_prefix() {
        let mut file = recording(false);
        file.truncate(file.len() - 3);

        let reader = RecordingReader::parse(&file, None).unwrap();
        assert!(!reader.is_finalized());
        assert_eq!(reader.len(), 1);
        assert!(reader.units()[0].keyframe);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            RecordingReader::parse(b"\x00\x00\x00\x10junkjunkjunkjunk", None),
            Err(StorageError::Malformed(_))
        ));
        assert!(RecordingReader::parse(&[], None).unwrap().is_empty());
    }
}
