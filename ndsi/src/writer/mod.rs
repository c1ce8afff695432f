//! 录像：将压缩访问单元按到达顺序写入分片MP4，并附带时间戳旁路文件

pub mod fmp4;
mod reader;
mod recorder;

pub use reader::{RecordedUnit, RecordingReader};
pub use recorder::Recorder;

use crate::config::RecorderConfig;
use crate::error::StorageError;
use crate::frame::CompressedChunk;
use crate::h264::{AccessUnit, AccessUnitAssembler, NalScanner, NalType, NalUnit, ParameterSets, ScannedNal, SliceHeader};
use bytes::Bytes;
use common::FrameFormat;
use fmp4::{Fmp4Muxer, TrackInfo};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 写入器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// 尚未见到SPS、PPS与IDR，丢弃所有输入
    WaitingForKeyframe,
    Writing,
    /// 写入失败，忽略后续输入
    Failed,
    Closed,
}

/// 录像结束时的统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub access_units: u64,
    pub keyframes: u64,
    /// 等待关键帧期间丢弃的访问单元
    pub discarded: u64,
    pub bytes_written: u64,
    pub first_timestamp: Option<f64>,
    pub last_timestamp: Option<f64>,
}

impl RecordingSummary {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            access_units: 0,
            keyframes: 0,
            discarded: 0,
            bytes_written: 0,
            first_timestamp: None,
            last_timestamp: None,
        }
    }

    pub fn duration(&self) -> f64 {
        match (self.first_timestamp, self.last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }
}

/// 时间戳旁路文件：`<stem>_timestamps.bin`
pub fn timestamps_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    path.with_file_name(format!("{}_timestamps.bin", stem))
}

/// 以当前时间生成录像文件名
pub fn default_file_name(sensor_id: &str) -> String {
    format!("{}_{}.mp4", sensor_id, chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

/// 同步写入器（由录像工作线程独占）
pub struct StreamWriter {
    summary: RecordingSummary,
    sink: Box<dyn Write + Send>,
    timestamps: Option<Box<dyn Write + Send>>,
    timescale: u32,
    state: WriterState,
    scanner: NalScanner,
    assembler: AccessUnitAssembler,
    params: ParameterSets,
    /// 尚未附着到图像的参数集/SEI
    prefix: Vec<NalUnit>,
    muxer: Option<Fmp4Muxer>,
    awaiting_idr: bool,
    last_sequence: Option<u32>,
    base_timestamp: Option<f64>,
    last_decode_time: Option<u64>,
    held: Option<HeldSample>,
    last_duration: Option<u32>,
    offset: u64,
}

impl StreamWriter {
    /// 创建录像文件（以及时间戳旁路文件）
    pub fn open(path: impl AsRef<Path>, config: &RecorderConfig) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let sink: Box<dyn Write + Send> = Box::new(BufWriter::new(File::create(&path)?));
        let timestamps: Option<Box<dyn Write + Send>> = if config.write_timestamps {
            Some(Box::new(BufWriter::new(File::create(timestamps_path(&path))?)))
        } else {
            None
        };

        info!("📼 Recording to {}", path.display());
        Ok(Self::with_sinks(path, sink, timestamps, config))
    }

    /// 使用任意输出（测试中用于注入写入失败）
    pub fn with_sinks(
        path: PathBuf,
        sink: Box<dyn Write + Send>,
        timestamps: Option<Box<dyn Write + Send>>,
        config: &RecorderConfig,
    ) -> Self {
        Self {
            summary: RecordingSummary::new(path),
            sink,
            timestamps,
            timescale: config.timescale,
            state: WriterState::WaitingForKeyframe,
            // 单个访问单元不会超过数据通道分片上限
            scanner: NalScanner::new(common::DEFAULT_MAX_CHUNK_SIZE),
            assembler: AccessUnitAssembler::new(),
            params: ParameterSets::new(),
            prefix: Vec::new(),
            muxer: None,
            awaiting_idr: false,
            last_sequence: None,
            base_timestamp: None,
            last_decode_time: None,
            held: None,
            last_duration: None,
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.summary.path
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn summary(&self) -> &RecordingSummary {
        &self.summary
    }

    /// 写入一个分片；失败后写入器进入 `Failed`
    pub fn write(&mut self, chunk: &CompressedChunk) -> Result<(), StorageError> {
        match self.state {
            WriterState::Failed | WriterState::Closed => return Err(StorageError::WriterFailed),
            WriterState::WaitingForKeyframe | WriterState::Writing => {}
        }

        let result = match chunk.format {
            FrameFormat::H264 => self.write_chunk(chunk),
            // 容器只承载H.264
            other => Err(StorageError::UnsupportedFormat(other)),
        };
        if result.is_err() {
            self.state = WriterState::Failed;
        }
        result
    }

    /// 丢弃未完成的访问单元，从下一个IDR继续
    pub fn resync(&mut self) {
        self.scanner.clear();
        self.assembler.clear();
        self.prefix.clear();
        if self.state == WriterState::Writing {
            self.awaiting_idr = true;
        }
    }

    /// 写出剩余访问单元与尾部索引
    pub fn close(mut self) -> Result<RecordingSummary, StorageError> {
        match self.state {
            WriterState::Failed | WriterState::Closed => return Err(StorageError::WriterFailed),
            WriterState::WaitingForKeyframe | WriterState::Writing => {}
        }

        self.finish_pending()?;
        self.flush_held()?;

        if let Some(muxer) = &self.muxer {
            let trailer = muxer.trailer();
            self.sink.write_all(&trailer)?;
            self.offset += trailer.len() as u64;
        }
        self.sink.flush()?;
        if let Some(timestamps) = self.timestamps.as_mut() {
            timestamps.flush()?;
        }

        self.state = WriterState::Closed;
        self.summary.bytes_written = self.offset;
        info!(
            "📼 Recording closed: {} ({} access units, {} bytes)",
            self.summary.path.display(),
            self.summary.access_units,
            self.summary.bytes_written
        );
        Ok(self.summary)
    }

    fn write_chunk(&mut self, chunk: &CompressedChunk) -> Result<(), StorageError> {
        if let Some(last) = self.last_sequence {
            if chunk.sequence != last.wrapping_add(1) {
                warn!(
                    "Recorder saw sequence gap ({} -> {}), waiting for next IDR",
                    last, chunk.sequence
                );
                self.resync();
            }
        }
        self.last_sequence = Some(chunk.sequence);

        let nals = match self.scanner.push(&chunk.payload, chunk.timestamp) {
            Ok(nals) => nals,
            Err(e) => {
                warn!("Recorder reassembly failed: {}", e);
                self.resync();
                Vec::new()
            }
        };
        for nal in nals {
            self.push_nal(nal)?;
        }

        if chunk.is_access_unit_end() {
            self.finish_pending()?;
        } else {
            let early = self
                .scanner
                .pending()
                .and_then(|prefix| self.assembler.complete_before(prefix));
            if let Some(au) = early {
                self.write_unit(au)?;
            }
        }
        Ok(())
    }

    fn finish_pending(&mut self) -> Result<(), StorageError> {
        if let Some(nal) = self.scanner.finish() {
            self.push_nal(nal)?;
        }
        if let Some(au) = self.assembler.finish() {
            self.write_unit(au)?;
        }
        Ok(())
    }

    fn push_nal(&mut self, nal: ScannedNal) -> Result<(), StorageError> {
        match self.assembler.push(nal.unit, nal.timestamp) {
            Some(au) => self.write_unit(au),
            None => Ok(()),
        }
    }

    fn write_unit(&mut self, mut au: AccessUnit) -> Result<(), StorageError> {
        for nal in &au.nals {
            if let Err(e) = self.params.update(nal) {
                warn!("Recorder dropping access unit with bad parameter set: {}", e);
                self.summary.discarded += 1;
                return Ok(());
            }
        }

        if !au.has_vcl() {
            // 参数集单独成单元时并入下一幅图像
            self.prefix.append(&mut au.nals);
            return Ok(());
        }
        if !self.prefix.is_empty() {
            let mut nals = std::mem::take(&mut self.prefix);
            nals.append(&mut au.nals);
            au.nals = nals;
        }

        let keyframe = au.is_keyframe();
        match self.state {
            WriterState::WaitingForKeyframe => {
                if !keyframe || !self.start(&au)? {
                    self.summary.discarded += 1;
                    return Ok(());
                }
            }
            WriterState::Writing if self.awaiting_idr => {
                if !keyframe {
                    self.summary.discarded += 1;
                    return Ok(());
                }
                self.awaiting_idr = false;
            }
            _ => {}
        }

        if keyframe {
            self.ensure_parameter_sets(&mut au);
        }
        self.write_fragment(&au, keyframe)
    }

    /// 收到首个IDR：写出初始化分片
    fn start(&mut self, au: &AccessUnit) -> Result<bool, StorageError> {
        let resolved = au
            .vcl_units()
            .next()
            .and_then(|nal| SliceHeader::parse(nal).ok())
            .and_then(|header| self.params.resolve(&header).ok());

        let Some((pps, sps)) = resolved else {
            debug!("IDR without usable parameter sets, still waiting");
            return Ok(false);
        };

        let muxer = Fmp4Muxer::new(TrackInfo::new(sps, pps, self.timescale));
        let init = muxer.init_segment();
        self.sink.write_all(&init)?;
        self.offset += init.len() as u64;
        self.muxer = Some(muxer);
        self.state = WriterState::Writing;

        info!(
            "📼 Recording started at {:.3}s ({}x{})",
            au.timestamp, sps.width, sps.height
        );
        Ok(true)
    }

    /// 关键帧样本自带SPS/PPS，使任意关键帧处的文件前缀可独立解码
    fn ensure_parameter_sets(&self, au: &mut AccessUnit) {
        if au.find(NalType::Sps).is_some() && au.find(NalType::Pps).is_some() {
            return;
        }
        let resolved = au
            .vcl_units()
            .next()
            .and_then(|nal| SliceHeader::parse(nal).ok())
            .and_then(|header| self.params.resolve(&header).ok());
        if let Some((pps, sps)) = resolved {
            let mut nals = vec![sps.raw.clone(), pps.raw.clone()];
            nals.extend(
                au.nals
                    .drain(..)
                    .filter(|n| !matches!(n.nal_type(), NalType::Sps | NalType::Pps)),
            );
            au.nals = nals;
        }
    }

    /// 样本时长取到下一个样本的间隔，因此每个样本要等下一个到达后才写出
    fn write_fragment(&mut self, au: &AccessUnit, keyframe: bool) -> Result<(), StorageError> {
        let base = *self.base_timestamp.get_or_insert(au.timestamp);
        let ticks = ((au.timestamp - base).max(0.0) * self.timescale as f64).round() as u64;
        // 解码时间必须单调
        let decode_time = match self.last_decode_time {
            Some(last) if ticks <= last => last + 1,
            _ => ticks,
        };
        self.last_decode_time = Some(decode_time);

        if let Some(previous) = self.held.take() {
            let duration = (decode_time - previous.decode_time).min(u32::MAX as u64) as u32;
            self.emit_sample(previous, duration)?;
        }
        self.held = Some(HeldSample {
            data: au.to_avcc(),
            decode_time,
            keyframe,
            timestamp: au.timestamp,
        });
        Ok(())
    }

    /// 关闭时写出最后一个样本，沿用上一个间隔
    fn flush_held(&mut self) -> Result<(), StorageError> {
        if let Some(last) = self.held.take() {
            let duration = self.last_duration.unwrap_or(self.timescale / 30);
            self.emit_sample(last, duration)?;
        }
        Ok(())
    }

    fn emit_sample(&mut self, sample: HeldSample, duration: u32) -> Result<(), StorageError> {
        let Some(muxer) = self.muxer.as_mut() else {
            return Ok(());
        };
        let fragment = muxer.fragment(sample.decode_time, duration, &sample.data, sample.keyframe, self.offset);
        self.sink.write_all(&fragment)?;
        self.offset += fragment.len() as u64;
        self.last_duration = Some(duration);

        if let Some(timestamps) = self.timestamps.as_mut() {
            timestamps.write_all(&sample.timestamp.to_le_bytes())?;
        }

        self.summary.access_units += 1;
        if sample.keyframe {
            self.summary.keyframes += 1;
        }
        self.summary.first_timestamp.get_or_insert(sample.timestamp);
        self.summary.last_timestamp = Some(sample.timestamp);
        self.summary.bytes_written = self.offset;
        Ok(())
    }
}

/// 等待下一个样本以确定时长
struct HeldSample {
    data: Bytes,
    decode_time: u64,
    keyframe: bool,
    timestamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

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

    fn chunk(sequence: u32, timestamp: f64, nals: &[&[u8]]) -> CompressedChunk {
        CompressedChunk::new(sequence, timestamp, annex_b(nals)).end_of_access_unit()
    }

    /// 可在测试中查看内容的输出
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn writer(sink: SharedSink, timestamps: SharedSink) -> StreamWriter {
        StreamWriter::with_sinks(
            PathBuf::from("memory.mp4"),
            Box::new(sink),
            Some(Box::new(timestamps)),
            &RecorderConfig::default(),
        )
    }

    #[test]
    fn test_discards_until_keyframe() {
        let sink = SharedSink::default();
        let mut writer = writer(sink.clone(), SharedSink::default());

        writer.write(&chunk(0, 0.0, &[&P])).unwrap();
        writer.write(&chunk(1, 0.1, &[&SPS, &PPS])).unwrap();
        assert_eq!(writer.state(), WriterState::WaitingForKeyframe);
        assert!(sink.0.lock().unwrap().is_empty());

        writer.write(&chunk(2, 0.2, &[&IDR])).unwrap();
        assert_eq!(writer.state(), WriterState::Writing);

        let summary = writer.close().unwrap();
        assert_eq!(summary.access_units, 1);
        assert_eq!(summary.discarded, 1);
        assert_eq!(summary.first_timestamp, Some(0.2));
    }

    #[test]
    fn test_timestamps_sidecar() {
        let timestamps = SharedSink::default();
        let mut writer = writer(SharedSink::default(), timestamps.clone());

        writer.write(&chunk(0, 1.5, &[&SPS, &PPS, &IDR])).unwrap();
        writer.write(&chunk(1, 1.6, &[&P])).unwrap();
        writer.close().unwrap();

        let bytes = timestamps.0.lock().unwrap().clone();
        assert_eq!(bytes.len(), 16);
        assert_eq!(f64::from_le_bytes(bytes[0..8].try_into().unwrap()), 1.5);
        assert_eq!(f64::from_le_bytes(bytes[8..16].try_into().unwrap()), 1.6);
    }

    /// 各trun中唯一样本的时长
    fn sample_durations(file: &[u8]) -> Vec<u32> {
        file.windows(4)
            .enumerate()
            .filter(|(_, tag)| *tag == b"trun")
            // version/flags、sample_count、data_offset 之后
            .map(|(at, _)| u32::from_be_bytes(file[at + 16..at + 20].try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_sample_duration_spans_to_next_unit() {
        let sink = SharedSink::default();
        let mut writer = writer(sink.clone(), SharedSink::default());

        writer.write(&chunk(0, 0.0, &[&SPS, &PPS, &IDR])).unwrap();
        writer.write(&chunk(1, 0.04, &[&P])).unwrap();
        // 样本等到下一个单元才写出
        assert_eq!(sample_durations(&sink.0.lock().unwrap()), vec![3600]);
        writer.write(&chunk(2, 0.10, &[&P])).unwrap();

        let summary = writer.close().unwrap();
        assert_eq!(summary.access_units, 3);
        assert_eq!(summary.last_timestamp, Some(0.10));
        // 最后一个样本沿用前一个间隔
        assert_eq!(sample_durations(&sink.0.lock().unwrap()), vec![3600, 5400, 5400]);

        let file = sink.0.lock().unwrap().clone();
        let reader = RecordingReader::parse(&file, None).unwrap();
        assert_eq!(reader.len(), 3);
    }

    #[test]
    fn test_gap_waits_for_next_idr() {
        let mut writer = writer(SharedSink::default(), SharedSink::default());
        writer.write(&chunk(0, 0.0, &[&SPS, &PPS, &IDR])).unwrap();
        writer.write(&chunk(5, 0.5, &[&P])).unwrap();
        writer.write(&chunk(6, 0.6, &[&IDR])).unwrap();

        let summary = writer.close().unwrap();
        assert_eq!(summary.access_units, 2);
        assert_eq!(summary.keyframes, 2);
        assert_eq!(summary.discarded, 1);
    }

    #[test]
    fn test_write_failure_is_sticky() {
        let mut writer = StreamWriter::with_sinks(
            PathBuf::from("broken.mp4"),
            Box::new(FailingSink),
            None,
            &RecorderConfig::default(),
        );

        let result = writer.write(&chunk(0, 0.0, &[&SPS, &PPS, &IDR]));
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(writer.state(), WriterState::Failed);

        assert!(matches!(
            writer.write(&chunk(1, 0.1, &[&P])),
            Err(StorageError::WriterFailed)
        ));
        assert!(writer.close().is_err());
    }

    #[test]
    fn test_mjpeg_input_fails_recording() {
        let sink = SharedSink::default();
        let mut writer = writer(sink.clone(), SharedSink::default());

        let jpeg = CompressedChunk::mjpeg(0, 0.0, 640, 480, vec![0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(matches!(
            writer.write(&jpeg),
            Err(StorageError::UnsupportedFormat(FrameFormat::Mjpeg))
        ));
        assert_eq!(writer.state(), WriterState::Failed);
        assert!(sink.0.lock().unwrap().is_empty());
        assert!(writer.close().is_err());
    }

    #[test]
    fn test_timestamps_path() {
        assert_eq!(
            timestamps_path(Path::new("/tmp/rec/world.mp4")),
            PathBuf::from("/tmp/rec/world_timestamps.bin")
        );
        assert!(default_file_name("cam-1").starts_with("cam-1_"));
    }
}
