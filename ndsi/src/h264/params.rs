//! SPS/PPS与条带头解析

use super::bits::{to_rbsp, BitReader};
use super::nal::{NalType, NalUnit};
use crate::error::DecodeError;
use std::collections::HashMap;

/// 需要解析chroma_format_idc等扩展字段的profile
const HIGH_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

/// 序列参数集
#[derive(Debug, Clone, PartialEq)]
pub struct Sps {
    pub id: u32,
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub max_num_ref_frames: u32,
    pub frame_mbs_only: bool,
    /// 宏块对齐的编码尺寸
    pub coded_width: u32,
    pub coded_height: u32,
    /// 裁剪后的显示尺寸
    pub width: u32,
    pub height: u32,
    pub raw: NalUnit,
}

impl Sps {
    pub fn parse(nal: &NalUnit) -> Result<Self, DecodeError> {
        let rbsp = to_rbsp(nal.payload());
        let mut r = BitReader::new(&rbsp, "SPS");

        let profile_idc = r.read_u8()?;
        let constraint_flags = r.read_u8()?;
        let level_idc = r.read_u8()?;
        let id = r.read_ue()?;
        if id > 31 {
            return Err(DecodeError::InvalidField { field: "seq_parameter_set_id", value: id });
        }

        let mut chroma_format_idc = 1;
        let mut separate_colour_plane = false;
        let mut bit_depth_luma = 8;
        let mut bit_depth_chroma = 8;

        if HIGH_PROFILES.contains(&profile_idc) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc > 3 {
                return Err(DecodeError::InvalidField { field: "chroma_format_idc", value: chroma_format_idc });
            }
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_bit()?;
            }
            bit_depth_luma = r.read_ue()? + 8;
            bit_depth_chroma = r.read_ue()? + 8;
            r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag

            if r.read_bit()? {
                let lists = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..lists {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let log2_max_frame_num_minus4 = r.read_ue()?;
        if log2_max_frame_num_minus4 > 12 {
            return Err(DecodeError::InvalidField {
                field: "log2_max_frame_num_minus4",
                value: log2_max_frame_num_minus4,
            });
        }

        let pic_order_cnt_type = r.read_ue()?;
        match pic_order_cnt_type {
            0 => {
                r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
            }
            1 => {
                r.skip_bits(1)?; // delta_pic_order_always_zero_flag
                r.read_se()?; // offset_for_non_ref_pic
                r.read_se()?; // offset_for_top_to_bottom_field
                let cycle = r.read_ue()?;
                if cycle > 255 {
                    return Err(DecodeError::InvalidField {
                        field: "num_ref_frames_in_pic_order_cnt_cycle",
                        value: cycle,
                    });
                }
                for _ in 0..cycle {
                    r.read_se()?;
                }
            }
            2 => {}
            other => {
                return Err(DecodeError::InvalidField { field: "pic_order_cnt_type", value: other });
            }
        }

        let max_num_ref_frames = r.read_ue()?;
        r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag

        let width_in_mbs = r.read_ue()? + 1;
        let height_in_map_units = r.read_ue()? + 1;
        let frame_mbs_only = r.read_bit()?;
        if !frame_mbs_only {
            r.skip_bits(1)?; // mb_adaptive_frame_field_flag
        }
        r.skip_bits(1)?; // direct_8x8_inference_flag

        let coded_width = width_in_mbs * 16;
        let coded_height = (2 - frame_mbs_only as u32) * height_in_map_units * 16;

        let (mut width, mut height) = (coded_width, coded_height);
        if r.read_bit()? {
            let left = r.read_ue()?;
            let right = r.read_ue()?;
            let top = r.read_ue()?;
            let bottom = r.read_ue()?;

            let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
            let (crop_x, crop_y) = if chroma_array_type == 0 {
                (1, 2 - frame_mbs_only as u32)
            } else {
                let sub_width = if chroma_format_idc == 3 { 1 } else { 2 };
                let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
                (sub_width, sub_height * (2 - frame_mbs_only as u32))
            };

            let crop_w = crop_x * (left + right);
            let crop_h = crop_y * (top + bottom);
            if crop_w >= coded_width || crop_h >= coded_height {
                return Err(DecodeError::InvalidField { field: "frame_cropping", value: crop_w.max(crop_h) });
            }
            width -= crop_w;
            height -= crop_h;
        }

        // VUI不影响重组与尺寸，忽略

        Ok(Self {
            id,
            profile_idc,
            constraint_flags,
            level_idc,
            chroma_format_idc,
            bit_depth_luma,
            bit_depth_chroma,
            log2_max_frame_num: log2_max_frame_num_minus4 + 4,
            pic_order_cnt_type,
            max_num_ref_frames,
            frame_mbs_only,
            coded_width,
            coded_height,
            width,
            height,
            raw: nal.clone(),
        })
    }

    pub fn is_high_profile(&self) -> bool {
        HIGH_PROFILES.contains(&self.profile_idc)
    }
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<(), DecodeError> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta + 256).rem_euclid(256);
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// 图像参数集
#[derive(Debug, Clone, PartialEq)]
pub struct Pps {
    pub id: u32,
    pub sps_id: u32,
    pub entropy_coding_mode: bool,
    pub raw: NalUnit,
}

impl Pps {
    pub fn parse(nal: &NalUnit) -> Result<Self, DecodeError> {
        let rbsp = to_rbsp(nal.payload());
        let mut r = BitReader::new(&rbsp, "PPS");

        let id = r.read_ue()?;
        if id > 255 {
            return Err(DecodeError::InvalidField { field: "pic_parameter_set_id", value: id });
        }
        let sps_id = r.read_ue()?;
        if sps_id > 31 {
            return Err(DecodeError::InvalidField { field: "seq_parameter_set_id", value: sps_id });
        }
        let entropy_coding_mode = r.read_bit()?;

        Ok(Self {
            id,
            sps_id,
            entropy_coding_mode,
            raw: nal.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    pub fn from_code(code: u32) -> Result<Self, DecodeError> {
        match code {
            0 | 5 => Ok(SliceType::P),
            1 | 6 => Ok(SliceType::B),
            2 | 7 => Ok(SliceType::I),
            3 | 8 => Ok(SliceType::Sp),
            4 | 9 => Ok(SliceType::Si),
            other => Err(DecodeError::InvalidField { field: "slice_type", value: other }),
        }
    }

    /// 需要参考图像的帧间条带
    pub fn is_inter(&self) -> bool {
        matches!(self, SliceType::P | SliceType::B | SliceType::Sp)
    }
}

/// 条带头的前三个字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pps_id: u32,
    pub idr: bool,
}

impl SliceHeader {
    pub fn parse(nal: &NalUnit) -> Result<Self, DecodeError> {
        // 三个ue(v)最多占用约12字节
        let payload = nal.payload();
        let prefix = &payload[..payload.len().min(32)];
        let rbsp = to_rbsp(prefix);
        let mut r = BitReader::new(&rbsp, "slice header");

        let first_mb_in_slice = r.read_ue()?;
        let slice_type = SliceType::from_code(r.read_ue()?)?;
        let pps_id = r.read_ue()?;
        if pps_id > 255 {
            return Err(DecodeError::InvalidField { field: "pic_parameter_set_id", value: pps_id });
        }

        let idr = nal.nal_type() == NalType::SliceIdr;
        if idr && slice_type.is_inter() {
            return Err(DecodeError::InvalidField { field: "IDR slice_type", value: slice_type as u32 });
        }

        Ok(Self {
            first_mb_in_slice,
            slice_type,
            pps_id,
            idr,
        })
    }
}

/// 当前生效的参数集
#[derive(Debug, Clone, Default)]
pub struct ParameterSets {
    sps: HashMap<u32, Sps>,
    pps: HashMap<u32, Pps>,
}

impl ParameterSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析并保存SPS/PPS，其他NAL忽略；返回是否为参数集
    pub fn update(&mut self, nal: &NalUnit) -> Result<bool, DecodeError> {
        match nal.nal_type() {
            NalType::Sps => {
                let sps = Sps::parse(nal)?;
                tracing::debug!(
                    "SPS {}: profile {} level {} {}x{}",
                    sps.id,
                    sps.profile_idc,
                    sps.level_idc,
                    sps.width,
                    sps.height
                );
                self.sps.insert(sps.id, sps);
                Ok(true)
            }
            NalType::Pps => {
                let pps = Pps::parse(nal)?;
                tracing::debug!("PPS {} -> SPS {}", pps.id, pps.sps_id);
                self.pps.insert(pps.id, pps);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn sps(&self, id: u32) -> Option<&Sps> {
        self.sps.get(&id)
    }

    pub fn pps(&self, id: u32) -> Option<&Pps> {
        self.pps.get(&id)
    }

    pub fn has_sps(&self) -> bool {
        !self.sps.is_empty()
    }

    pub fn has_pps(&self) -> bool {
        !self.pps.is_empty()
    }

    /// 条带引用的PPS及其SPS
    pub fn resolve(&self, slice: &SliceHeader) -> Result<(&Pps, &Sps), DecodeError> {
        let pps = self.pps(slice.pps_id).ok_or(DecodeError::UnknownPps(slice.pps_id))?;
        let sps = self.sps(pps.sps_id).ok_or(DecodeError::UnknownSps(pps.sps_id))?;
        Ok((pps, sps))
    }

    pub fn clear(&mut self) {
        self.sps.clear();
        self.pps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::bits::{to_ebsp, BitWriter};

    const SPS_320X240: [u8; 8] = [0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x38, 0x80];

    fn nal(bytes: &[u8]) -> NalUnit {
        NalUnit::new(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_parse_baseline_sps() {
        let sps = Sps::parse(&nal(&SPS_320X240)).unwrap();
        assert_eq!(sps.id, 0);
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.level_idc, 30);
        assert_eq!((sps.width, sps.height), (320, 240));
        assert_eq!(sps.log2_max_frame_num, 4);
        assert!(sps.frame_mbs_only);
        assert!(!sps.is_high_profile());
    }

    #[test]
    fn test_parse_high_profile_sps_with_cropping() {
        // 1920x1080: 120x68宏块，底部裁剪8行（chroma 4:2:0 -> 4个单位）
        let mut w = BitWriter::new();
        w.put_bits(100, 8);
        w.put_bits(0, 8);
        w.put_bits(40, 8);
        w.put_ue(0); // sps id
        w.put_ue(1); // chroma_format_idc
        w.put_ue(0);
        w.put_ue(0);
        w.put_bit(false);
        w.put_bit(false); // no scaling matrix
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(2); // poc type 2
        w.put_ue(1);
        w.put_bit(false);
        w.put_ue(119);
        w.put_ue(67);
        w.put_bit(true); // frame_mbs_only
        w.put_bit(true);
        w.put_bit(true); // cropping
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(4);
        w.put_bit(false); // no VUI

        let mut bytes = vec![0x67];
        bytes.extend(to_ebsp(&w.finish()));

        let sps = Sps::parse(&nal(&bytes)).unwrap();
        assert_eq!((sps.coded_width, sps.coded_height), (1920, 1088));
        assert_eq!((sps.width, sps.height), (1920, 1080));
        assert!(sps.is_high_profile());
        assert_eq!(sps.chroma_format_idc, 1);
    }

    #[test]
    fn test_truncated_sps() {
        let result = Sps::parse(&nal(&SPS_320X240[..4]));
        assert!(matches!(result, Err(DecodeError::Truncated("SPS"))));
    }

    #[test]
    fn test_parse_pps() {
        let pps = Pps::parse(&nal(&PPS)).unwrap();
        assert_eq!(pps.id, 0);
        assert_eq!(pps.sps_id, 0);
        assert!(!pps.entropy_coding_mode);
    }

    #[test]
    fn test_slice_headers() {
        let idr = SliceHeader::parse(&nal(&[0x65, 0x88, 0x84, 0x21, 0xA0])).unwrap();
        assert_eq!(idr.first_mb_in_slice, 0);
        assert_eq!(idr.slice_type, SliceType::I);
        assert!(idr.idr);

        let p = SliceHeader::parse(&nal(&[0x41, 0x9A, 0x21, 0x40])).unwrap();
        assert_eq!(p.slice_type, SliceType::P);
        assert!(p.slice_type.is_inter());
        assert!(!p.idr);

        assert!(SliceHeader::parse(&nal(&[0x41])).is_err());
    }

    #[test]
    fn test_resolve_unknown_pps() {
        let mut params = ParameterSets::new();
        let slice = SliceHeader::parse(&nal(&[0x41, 0x9A, 0x21, 0x40])).unwrap();
        assert_eq!(params.resolve(&slice).unwrap_err(), DecodeError::UnknownPps(0));

        params.update(&nal(&PPS)).unwrap();
        assert_eq!(params.resolve(&slice).unwrap_err(), DecodeError::UnknownSps(0));

        params.update(&nal(&SPS_320X240)).unwrap();
        let (_, sps) = params.resolve(&slice).unwrap();
        assert_eq!(sps.width, 320);

        params.clear();
        assert!(!params.has_sps() && !params.has_pps());
    }
}
