// 合成H.264码流：Baseline SPS/PPS + 带有效条带头的IDR/P条带
//
// 条带数据是填充字节，只保证码流结构合法（起始码、参数集、条带头），
// 用于验证信令流程、重组与录像，不用于画面解码。

use crate::config::SensorConfig;
use bytes::{BufMut, Bytes, BytesMut};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// pps_id=0, sps_id=0, CAVLC
const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

/// 一个编码好的访问单元
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub keyframe: bool,
    pub timestamp: f64,
    pub index: u64,
}

pub struct SyntheticStream {
    sps: Vec<u8>,
    fps: u32,
    gop: u32,
    frame_bytes: usize,
    frame: u64,
    since_keyframe: u32,
    idr_pic_id: u32,
    force_keyframe: bool,
}

impl SyntheticStream {
    pub fn new(sensor: &SensorConfig) -> Self {
        Self {
            sps: build_sps(sensor.width, sensor.height),
            fps: sensor.fps.max(1),
            gop: sensor.gop.max(1),
            frame_bytes: sensor.frame_bytes,
            frame: 0,
            since_keyframe: 0,
            idr_pic_id: 0,
            force_keyframe: true,
        }
    }

    /// 下一帧输出IDR（带SPS/PPS）
    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame
    }

    pub fn next_unit(&mut self) -> EncodedUnit {
        let keyframe = self.force_keyframe || self.since_keyframe >= self.gop;
        let index = self.frame;

        let mut data = BytesMut::with_capacity(self.frame_bytes + 64);
        if keyframe {
            put_nal(&mut data, &self.sps);
            put_nal(&mut data, &PPS);
            put_nal(&mut data, &self.slice(true));
            self.force_keyframe = false;
            self.since_keyframe = 1;
            self.idr_pic_id = (self.idr_pic_id + 1) % 16;
        } else {
            put_nal(&mut data, &self.slice(false));
            self.since_keyframe += 1;
        }

        self.frame += 1;
        EncodedUnit {
            data: data.freeze(),
            keyframe,
            timestamp: index as f64 / self.fps as f64,
            index,
        }
    }

    fn slice(&self, idr: bool) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.put_ue(0); // first_mb_in_slice
        w.put_ue(if idr { 7 } else { 5 }); // I / P，整幅图像同类型
        w.put_ue(0); // pic_parameter_set_id
        w.put_bits(self.since_keyframe_frame_num(idr), 4);
        if idr {
            w.put_ue(self.idr_pic_id);
        }
        w.put_bits(((self.frame * 2) % 16) as u32, 4); // pic_order_cnt_lsb

        let mut rbsp = w.finish();
        // 非零填充，不会出现起始码
        rbsp.extend((0..self.frame_bytes).map(|i| ((self.frame as usize + i) % 251 + 1) as u8));
        rbsp.push(0x80);

        let header = if idr { 0x65 } else { 0x41 };
        let mut nal = vec![header];
        nal.extend(to_ebsp(&rbsp));
        nal
    }

    fn since_keyframe_frame_num(&self, idr: bool) -> u32 {
        if idr {
            0
        } else {
            self.since_keyframe % 16
        }
    }
}

fn put_nal(out: &mut BytesMut, nal: &[u8]) {
    out.put_slice(&START_CODE);
    out.put_slice(nal);
}

/// Baseline profile 66, level 3.0, POC type 0, 单参考帧
pub fn build_sps(width: u32, height: u32) -> Vec<u8> {
    let mbs_wide = (width + 15) / 16;
    let mbs_high = (height + 15) / 16;

    let mut w = BitWriter::new();
    w.put_bits(66, 8); // profile_idc
    w.put_bits(0xC0, 8); // constraint_set0/1
    w.put_bits(30, 8); // level_idc
    w.put_ue(0); // seq_parameter_set_id
    w.put_ue(0); // log2_max_frame_num_minus4
    w.put_ue(0); // pic_order_cnt_type
    w.put_ue(0); // log2_max_pic_order_cnt_lsb_minus4
    w.put_ue(1); // max_num_ref_frames
    w.put_bit(false); // gaps_in_frame_num_value_allowed_flag
    w.put_ue(mbs_wide - 1);
    w.put_ue(mbs_high - 1);
    w.put_bit(true); // frame_mbs_only_flag
    w.put_bit(true); // direct_8x8_inference_flag

    // 4:2:0 裁剪单位为2像素
    let crop_right = (mbs_wide * 16 - width) / 2;
    let crop_bottom = (mbs_high * 16 - height) / 2;
    if crop_right > 0 || crop_bottom > 0 {
        w.put_bit(true);
        w.put_ue(0);
        w.put_ue(crop_right);
        w.put_ue(0);
        w.put_ue(crop_bottom);
    } else {
        w.put_bit(false);
    }
    w.put_bit(false); // vui_parameters_present_flag

    let mut sps = vec![0x67];
    sps.extend(to_ebsp(&w.finish()));
    sps
}

/// 插入防竞争字节
fn to_ebsp(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + 8);
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self::default()
    }

    fn put_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.used = 0;
        }
    }

    fn put_bits(&mut self, value: u32, n: u8) {
        for i in (0..n).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    fn put_ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros();
        for _ in 1..len {
            self.put_bit(false);
        }
        for i in (0..len).rev() {
            self.put_bit((code >> i) & 1 == 1);
        }
    }

    /// 追加 rbsp_trailing_bits
    fn finish(mut self) -> Vec<u8> {
        self.put_bit(true);
        while self.used != 0 {
            self.put_bit(false);
        }
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal_types(data: &[u8]) -> Vec<u8> {
        let mut types = Vec::new();
        let mut i = 0;
        while i + 4 < data.len() {
            if data[i..i + 4] == START_CODE {
                types.push(data[i + 4] & 0x1F);
                i += 4;
            } else {
                i += 1;
            }
        }
        types
    }

    #[test]
    fn test_sps_for_qvga() {
        assert_eq!(build_sps(320, 240), vec![0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8]);
    }

    #[test]
    fn test_gop_structure() {
        let sensor = SensorConfig {
            gop: 3,
            frame_bytes: 16,
            ..SensorConfig::default()
        };
        let mut stream = SyntheticStream::new(&sensor);

        let keyframes: Vec<bool> = (0..7).map(|_| stream.next_unit().keyframe).collect();
        assert_eq!(keyframes, vec![true, false, false, true, false, false, true]);

        let unit = stream.next_unit();
        assert_eq!(nal_types(&unit.data), vec![1]);
        assert_eq!(unit.index, 7);
        assert!((unit.timestamp - 7.0 / 30.0).abs() < 1e-9);

        stream.request_keyframe();
        let unit = stream.next_unit();
        assert!(unit.keyframe);
        assert_eq!(nal_types(&unit.data), vec![7, 8, 5]);
    }

    #[test]
    fn test_no_start_code_emulation() {
        let sensor = SensorConfig {
            frame_bytes: 2048,
            ..SensorConfig::default()
        };
        let mut stream = SyntheticStream::new(&sensor);
        for _ in 0..40 {
            let unit = stream.next_unit();
            let expected = if unit.keyframe { 3 } else { 1 };
            assert_eq!(nal_types(&unit.data).len(), expected);
        }
    }
}
