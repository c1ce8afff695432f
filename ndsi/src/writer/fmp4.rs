// 录像容器 - 分片MP4（fMP4）封装
//
// ftyp + moov（avcC取自首个SPS/PPS），每个访问单元一个 moof + mdat，
// 关闭时追加 mfra 随机访问索引。

use crate::h264::{Pps, Sps};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// BytesMut 扩展 trait，用于写入24位和48位整数
trait BytesMutExt {
    fn put_u24(&mut self, value: u32);
    fn put_u48(&mut self, value: u64);
}

impl BytesMutExt for BytesMut {
    fn put_u24(&mut self, value: u32) {
        self.put_u8((value >> 16) as u8);
        self.put_u8((value >> 8) as u8);
        self.put_u8(value as u8);
    }

    fn put_u48(&mut self, value: u64) {
        self.put_u16((value >> 32) as u16);
        self.put_u32(value as u32);
    }
}

/// fMP4 Box类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BoxType {
    Ftyp = 0x66747970, // 'ftyp'
    Moov = 0x6d6f6f76, // 'moov'
    Moof = 0x6d6f6f66, // 'moof'
    Mdat = 0x6d646174, // 'mdat'
    Mvhd = 0x6d766864, // 'mvhd'
    Trak = 0x7472616b, // 'trak'
    Tkhd = 0x746b6864, // 'tkhd'
    Mdia = 0x6d646961, // 'mdia'
    Mdhd = 0x6d646864, // 'mdhd'
    Hdlr = 0x68646c72, // 'hdlr'
    Minf = 0x6d696e66, // 'minf'
    Vmhd = 0x766d6864, // 'vmhd'
    Dinf = 0x64696e66, // 'dinf'
    Dref = 0x64726566, // 'dref'
    Url = 0x75726c20,  // 'url '
    Stbl = 0x7374626c, // 'stbl'
    Stsd = 0x73747364, // 'stsd'
    Stts = 0x73747473, // 'stts'
    Stsc = 0x73747363, // 'stsc'
    Stsz = 0x7374737a, // 'stsz'
    Stco = 0x7374636f, // 'stco'
    Mvex = 0x6d766578, // 'mvex'
    Trex = 0x74726578, // 'trex'
    Mfhd = 0x6d666864, // 'mfhd'
    Traf = 0x74726166, // 'traf'
    Tfhd = 0x74666864, // 'tfhd'
    Tfdt = 0x74666474, // 'tfdt'
    Trun = 0x7472756e, // 'trun'
    Avc1 = 0x61766331, // 'avc1'
    AvcC = 0x61766343, // 'avcC'
    Mfra = 0x6d667261, // 'mfra'
    Tfra = 0x74667261, // 'tfra'
    Mfro = 0x6d66726f, // 'mfro'
}

impl BoxType {
    pub fn fourcc(self) -> [u8; 4] {
        (self as u32).to_be_bytes()
    }
}

pub const TRACK_ID: u32 = 1;

/// trun样本标志
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000; // sample_depends_on = 2
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000; // sample_depends_on = 1, is_non_sync

/// 轨道描述（来自首个SPS/PPS）
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub width: u16,
    pub height: u16,
    pub timescale: u32,
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub high_profile: bool,
    pub sps: Bytes,
    pub pps: Bytes,
}

impl TrackInfo {
    pub fn new(sps: &Sps, pps: &Pps, timescale: u32) -> Self {
        Self {
            width: sps.width.min(u16::MAX as u32) as u16,
            height: sps.height.min(u16::MAX as u32) as u16,
            timescale,
            profile_idc: sps.profile_idc,
            constraint_flags: sps.constraint_flags,
            level_idc: sps.level_idc,
            chroma_format_idc: sps.chroma_format_idc as u8,
            bit_depth_luma: sps.bit_depth_luma as u8,
            bit_depth_chroma: sps.bit_depth_chroma as u8,
            high_profile: sps.is_high_profile(),
            sps: sps.raw.bytes(),
            pps: pps.raw.bytes(),
        }
    }
}

/// mfra中的随机访问点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomAccessEntry {
    pub time: u64,
    pub moof_offset: u64,
}

/// fMP4封装器
pub struct Fmp4Muxer {
    track: TrackInfo,
    sequence_number: u32,
    random_access: Vec<RandomAccessEntry>,
}

impl Fmp4Muxer {
    pub fn new(track: TrackInfo) -> Self {
        debug!(
            "Creating fMP4 muxer {}x{} @ {}Hz",
            track.width, track.height, track.timescale
        );
        Self {
            track,
            sequence_number: 0,
            random_access: Vec::new(),
        }
    }

    pub fn track(&self) -> &TrackInfo {
        &self.track
    }

    pub fn fragments_written(&self) -> u32 {
        self.sequence_number
    }

    pub fn random_access_points(&self) -> &[RandomAccessEntry] {
        &self.random_access
    }

    /// 初始化分片：ftyp + moov
    pub fn init_segment(&self) -> BytesMut {
        let mut buffer = BytesMut::new();
        self.write_ftyp_box(&mut buffer);
        self.write_moov_box(&mut buffer);
        buffer
    }

    /// 一个样本的 moof + mdat；`moof_offset` 为该moof在文件中的偏移（用于mfra）
    pub fn fragment(
        &mut self,
        decode_time: u64,
        duration: u32,
        sample: &[u8],
        keyframe: bool,
        moof_offset: u64,
    ) -> BytesMut {
        self.sequence_number += 1;

        // trun的大小与data_offset取值无关，先按0写出得到moof长度
        let sized = self.moof_box(decode_time, duration, sample.len() as u32, keyframe, 0);
        let data_offset = sized.len() as u32 + 8;
        let moof = self.moof_box(decode_time, duration, sample.len() as u32, keyframe, data_offset);

        let mut buffer = BytesMut::with_capacity(moof.len() + 8 + sample.len());
        buffer.extend_from_slice(&moof);
        write_box(&mut buffer, BoxType::Mdat, sample);

        if keyframe {
            self.random_access.push(RandomAccessEntry {
                time: decode_time,
                moof_offset,
            });
        }
        buffer
    }

    /// 尾部随机访问索引：mfra(tfra + mfro)
    pub fn trailer(&self) -> BytesMut {
        let mut tfra = BytesMut::new();
        tfra.put_u8(1); // version
        tfra.put_u24(0); // flags
        tfra.put_u32(TRACK_ID);
        tfra.put_u32(0); // length_size_of_traf/trun/sample_num = 0 (1字节)
        tfra.put_u32(self.random_access.len() as u32);
        for entry in &self.random_access {
            tfra.put_u64(entry.time);
            tfra.put_u64(entry.moof_offset);
            tfra.put_u8(1); // traf_number
            tfra.put_u8(1); // trun_number
            tfra.put_u8(1); // sample_number
        }

        let mut mfra_data = BytesMut::new();
        write_box(&mut mfra_data, BoxType::Tfra, &tfra);

        // mfro记录整个mfra的大小
        let mfra_size = 8 + mfra_data.len() as u32 + 16;
        let mut mfro = BytesMut::new();
        mfro.put_u8(0); // version
        mfro.put_u24(0); // flags
        mfro.put_u32(mfra_size);
        write_box(&mut mfra_data, BoxType::Mfro, &mfro);

        let mut buffer = BytesMut::new();
        write_box(&mut buffer, BoxType::Mfra, &mfra_data);
        buffer
    }

    /// 写入ftyp box（文件类型）
    fn write_ftyp_box(&self, buffer: &mut BytesMut) {
        let mut data = BytesMut::new();
        data.extend_from_slice(b"iso5"); // major brand
        data.put_u32(0); // minor version
        data.extend_from_slice(b"iso5");
        data.extend_from_slice(b"iso6");
        data.extend_from_slice(b"avc1");
        data.extend_from_slice(b"mp41");
        write_box(buffer, BoxType::Ftyp, &data);
    }

    /// 写入moov box（媒体元数据）
    fn write_moov_box(&self, buffer: &mut BytesMut) {
        let mut moov = BytesMut::new();
        self.write_mvhd_box(&mut moov);
        self.write_trak_box(&mut moov);

        let mut trex = BytesMut::new();
        trex.put_u8(0); // version
        trex.put_u24(0); // flags
        trex.put_u32(TRACK_ID);
        trex.put_u32(1); // default_sample_description_index
        trex.put_u32(0); // default_sample_duration
        trex.put_u32(0); // default_sample_size
        trex.put_u32(0); // default_sample_flags
        let mut mvex = BytesMut::new();
        write_box(&mut mvex, BoxType::Trex, &trex);
        write_box(&mut moov, BoxType::Mvex, &mvex);

        write_box(buffer, BoxType::Moov, &moov);
    }

    fn write_mvhd_box(&self, buffer: &mut BytesMut) {
        let mut data = BytesMut::new();
        data.put_u8(1); // version
        data.put_u24(0); // flags
        data.put_u64(0); // creation_time
        data.put_u64(0); // modification_time
        data.put_u32(self.track.timescale);
        data.put_u64(0); // duration (fragmented)
        data.put_u32(0x00010000); // rate (1.0)
        data.put_u16(0x0100); // volume (1.0)
        data.put_u16(0); // reserved
        data.put_u64(0); // reserved
        put_unity_matrix(&mut data);
        for _ in 0..6 {
            data.put_u32(0); // pre_defined
        }
        data.put_u32(TRACK_ID + 1); // next_track_ID
        write_box(buffer, BoxType::Mvhd, &data);
    }

    fn write_trak_box(&self, buffer: &mut BytesMut) {
        let mut trak = BytesMut::new();

        let mut tkhd = BytesMut::new();
        tkhd.put_u8(1); // version
        tkhd.put_u24(0x000007); // flags (enabled, in movie, in preview)
        tkhd.put_u64(0); // creation_time
        tkhd.put_u64(0); // modification_time
        tkhd.put_u32(TRACK_ID);
        tkhd.put_u32(0); // reserved
        tkhd.put_u64(0); // duration
        tkhd.put_u64(0); // reserved
        tkhd.put_u16(0); // layer
        tkhd.put_u16(0); // alternate_group
        tkhd.put_u16(0); // volume
        tkhd.put_u16(0); // reserved
        put_unity_matrix(&mut tkhd);
        tkhd.put_u32((self.track.width as u32) << 16);
        tkhd.put_u32((self.track.height as u32) << 16);
        write_box(&mut trak, BoxType::Tkhd, &tkhd);

        let mut mdia = BytesMut::new();

        let mut mdhd = BytesMut::new();
        mdhd.put_u8(1); // version
        mdhd.put_u24(0); // flags
        mdhd.put_u64(0); // creation_time
        mdhd.put_u64(0); // modification_time
        mdhd.put_u32(self.track.timescale);
        mdhd.put_u64(0); // duration
        mdhd.put_u16(0x55c4); // language (und)
        mdhd.put_u16(0); // pre_defined
        write_box(&mut mdia, BoxType::Mdhd, &mdhd);

        let mut hdlr = BytesMut::new();
        hdlr.put_u8(0); // version
        hdlr.put_u24(0); // flags
        hdlr.put_u32(0); // pre_defined
        hdlr.extend_from_slice(b"vide");
        hdlr.put_u32(0);
        hdlr.put_u32(0);
        hdlr.put_u32(0);
        hdlr.extend_from_slice(b"SensorVideo\0");
        write_box(&mut mdia, BoxType::Hdlr, &hdlr);

        self.write_minf_box(&mut mdia);
        write_box(&mut trak, BoxType::Mdia, &mdia);

        write_box(buffer, BoxType::Trak, &trak);
    }

    fn write_minf_box(&self, buffer: &mut BytesMut) {
        let mut minf = BytesMut::new();

        let mut vmhd = BytesMut::new();
        vmhd.put_u8(0); // version
        vmhd.put_u24(1); // flags
        vmhd.put_u16(0); // graphicsmode
        vmhd.put_u16(0);
        vmhd.put_u16(0);
        vmhd.put_u16(0); // opcolor
        write_box(&mut minf, BoxType::Vmhd, &vmhd);

        let mut url = BytesMut::new();
        url.put_u8(0);
        url.put_u24(1); // self-contained
        let mut dref = BytesMut::new();
        dref.put_u8(0);
        dref.put_u24(0);
        dref.put_u32(1); // entry_count
        write_box(&mut dref, BoxType::Url, &url);
        let mut dinf = BytesMut::new();
        write_box(&mut dinf, BoxType::Dref, &dref);
        write_box(&mut minf, BoxType::Dinf, &dinf);

        let mut stbl = BytesMut::new();
        self.write_stsd_box(&mut stbl);
        // 分片文件的样本表为空
        for box_type in [BoxType::Stts, BoxType::Stsc, BoxType::Stco] {
            let mut empty = BytesMut::new();
            empty.put_u32(0); // version + flags
            empty.put_u32(0); // entry_count
            write_box(&mut stbl, box_type, &empty);
        }
        let mut stsz = BytesMut::new();
        stsz.put_u32(0); // version + flags
        stsz.put_u32(0); // sample_size
        stsz.put_u32(0); // sample_count
        write_box(&mut stbl, BoxType::Stsz, &stsz);
        write_box(&mut minf, BoxType::Stbl, &stbl);

        write_box(buffer, BoxType::Minf, &minf);
    }

    fn write_stsd_box(&self, buffer: &mut BytesMut) {
        let mut stsd = BytesMut::new();
        stsd.put_u8(0); // version
        stsd.put_u24(0); // flags
        stsd.put_u32(1); // entry_count

        let mut avc1 = BytesMut::new();
        avc1.put_u48(0); // reserved
        avc1.put_u16(1); // data_reference_index
        avc1.put_u16(0); // pre_defined
        avc1.put_u16(0); // reserved
        avc1.put_u32(0);
        avc1.put_u32(0);
        avc1.put_u32(0); // pre_defined
        avc1.put_u16(self.track.width);
        avc1.put_u16(self.track.height);
        avc1.put_u32(0x00480000); // horizresolution
        avc1.put_u32(0x00480000); // vertresolution
        avc1.put_u32(0); // reserved
        avc1.put_u16(1); // frame_count
        avc1.put_bytes(0, 32); // compressorname
        avc1.put_u16(0x0018); // depth
        avc1.put_u16(0xffff); // pre_defined

        write_box(&mut avc1, BoxType::AvcC, &self.avc_decoder_configuration());
        write_box(&mut stsd, BoxType::Avc1, &avc1);
        write_box(buffer, BoxType::Stsd, &stsd);
    }

    /// AVCDecoderConfigurationRecord（ISO/IEC 14496-15）
    fn avc_decoder_configuration(&self) -> BytesMut {
        let track = &self.track;
        let mut avcc = BytesMut::new();
        avcc.put_u8(1); // configurationVersion
        avcc.put_u8(track.profile_idc);
        avcc.put_u8(track.constraint_flags);
        avcc.put_u8(track.level_idc);
        avcc.put_u8(0xff); // lengthSizeMinusOne = 3
        avcc.put_u8(0xe1); // numOfSequenceParameterSets = 1
        avcc.put_u16(track.sps.len() as u16);
        avcc.extend_from_slice(&track.sps);
        avcc.put_u8(1); // numOfPictureParameterSets
        avcc.put_u16(track.pps.len() as u16);
        avcc.extend_from_slice(&track.pps);

        if track.high_profile {
            avcc.put_u8(0xfc | (track.chroma_format_idc & 0x03));
            avcc.put_u8(0xf8 | (track.bit_depth_luma.saturating_sub(8) & 0x07));
            avcc.put_u8(0xf8 | (track.bit_depth_chroma.saturating_sub(8) & 0x07));
            avcc.put_u8(0); // numOfSequenceParameterSetExt
        }
        avcc
    }

    fn moof_box(&self, decode_time: u64, duration: u32, size: u32, keyframe: bool, data_offset: u32) -> BytesMut {
        let mut moof = BytesMut::new();

        let mut mfhd = BytesMut::new();
        mfhd.put_u8(0); // version
        mfhd.put_u24(0); // flags
        mfhd.put_u32(self.sequence_number);
        write_box(&mut moof, BoxType::Mfhd, &mfhd);

        let mut traf = BytesMut::new();

        let mut tfhd = BytesMut::new();
        tfhd.put_u8(0); // version
        tfhd.put_u24(0x020000); // default-base-is-moof
        tfhd.put_u32(TRACK_ID);
        write_box(&mut traf, BoxType::Tfhd, &tfhd);

        let mut tfdt = BytesMut::new();
        tfdt.put_u8(1); // version
        tfdt.put_u24(0); // flags
        tfdt.put_u64(decode_time); // baseMediaDecodeTime
        write_box(&mut traf, BoxType::Tfdt, &tfdt);

        let mut trun = BytesMut::new();
        trun.put_u8(0); // version
        trun.put_u24(0x000701); // data-offset, sample-duration, sample-size, sample-flags
        trun.put_u32(1); // sample_count
        trun.put_u32(data_offset);
        trun.put_u32(duration);
        trun.put_u32(size);
        trun.put_u32(if keyframe { SAMPLE_FLAGS_SYNC } else { SAMPLE_FLAGS_NON_SYNC });
        write_box(&mut traf, BoxType::Trun, &trun);

        write_box(&mut moof, BoxType::Traf, &traf);

        let mut buffer = BytesMut::new();
        write_box(&mut buffer, BoxType::Moof, &moof);
        buffer
    }
}

fn put_unity_matrix(data: &mut BytesMut) {
    for value in [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000] {
        data.put_u32(value);
    }
}

/// 写入box
fn write_box(buffer: &mut BytesMut, box_type: BoxType, data: &[u8]) {
    buffer.put_u32(8 + data.len() as u32);
    buffer.put_u32(box_type as u32);
    buffer.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::NalUnit;

    fn track() -> TrackInfo {
        let sps = Sps::parse(&NalUnit::new(vec![0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8]).unwrap()).unwrap();
        let pps = Pps::parse(&NalUnit::new(vec![0x68, 0xCE, 0x38, 0x80]).unwrap()).unwrap();
        TrackInfo::new(&sps, &pps, 90_000)
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    #[test]
    fn test_init_segment_carries_parameter_sets() {
        let muxer = Fmp4Muxer::new(track());
        let init = muxer.init_segment();

        assert_eq!(&init[4..8], b"ftyp");
        let avcc = find(&init, b"avcC").unwrap();
        // configurationVersion, profile, compat, level
        assert_eq!(&init[avcc + 4..avcc + 8], &[1, 66, 0xC0, 30]);
        assert!(find(&init, &[0x67, 0x42, 0xC0, 0x1E]).is_some());
        assert!(find(&init, &[0x68, 0xCE, 0x38, 0x80]).is_some());
    }

    #[test]
    fn test_fragment_data_offset_points_to_sample() {
        let mut muxer = Fmp4Muxer::new(track());
        let sample = [0, 0, 0, 2, 0x41, 0x9A];
        let fragment = muxer.fragment(3000, 3000, &sample, false, 1000);

        let moof_size = u32::from_be_bytes([fragment[0], fragment[1], fragment[2], fragment[3]]) as usize;
        let trun = find(&fragment, b"trun").unwrap();
        // size(4) type(4) version+flags(4) count(4) -> data_offset
        let offset_pos = trun + 4 + 4 + 4;
        let data_offset = u32::from_be_bytes(fragment[offset_pos..offset_pos + 4].try_into().unwrap()) as usize;

        assert_eq!(data_offset, moof_size + 8);
        assert_eq!(&fragment[data_offset..], &sample);
        assert!(muxer.random_access_points().is_empty());
        assert_eq!(muxer.fragments_written(), 1);
    }

    #[test]
    fn test_trailer_indexes_keyframes() {
        let mut muxer = Fmp4Muxer::new(track());
        muxer.fragment(0, 3000, &[0, 0, 0, 1, 0x65], true, 700);
        muxer.fragment(3000, 3000, &[0, 0, 0, 1, 0x41], false, 800);

        let trailer = muxer.trailer();
        assert_eq!(&trailer[4..8], b"mfra");

        let mfra_size = u32::from_be_bytes(trailer[0..4].try_into().unwrap()) as usize;
        assert_eq!(mfra_size, trailer.len());
        let mfro_size = u32::from_be_bytes(trailer[trailer.len() - 4..].try_into().unwrap()) as usize;
        assert_eq!(mfro_size, trailer.len());

        assert_eq!(
            muxer.random_access_points(),
            &[RandomAccessEntry { time: 0, moof_offset: 700 }]
        );
    }
}
