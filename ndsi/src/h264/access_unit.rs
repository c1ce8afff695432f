use super::nal::{NalType, NalUnit};
use super::params::SliceHeader;
use bytes::{BufMut, Bytes, BytesMut};

/// 访问单元：一幅编码图像及其附带的非VCL单元
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUnit {
    pub nals: Vec<NalUnit>,
    /// 首字节所在分片的时间戳
    pub timestamp: f64,
}

impl AccessUnit {
    pub fn new(timestamp: f64) -> Self {
        Self {
            nals: Vec::new(),
            timestamp,
        }
    }

    pub fn has_vcl(&self) -> bool {
        self.nals.iter().any(|n| n.nal_type().is_vcl())
    }

    /// 包含IDR条带
    pub fn is_keyframe(&self) -> bool {
        self.nals.iter().any(|n| n.nal_type() == NalType::SliceIdr)
    }

    pub fn vcl_units(&self) -> impl Iterator<Item = &NalUnit> {
        self.nals.iter().filter(|n| n.nal_type().is_vcl())
    }

    pub fn find(&self, nal_type: NalType) -> Option<&NalUnit> {
        self.nals.iter().find(|n| n.nal_type() == nal_type)
    }

    /// 以四字节起始码拼接
    pub fn to_annex_b(&self) -> Bytes {
        let size: usize = self.nals.iter().map(|n| n.len() + 4).sum();
        let mut out = BytesMut::with_capacity(size);
        for nal in &self.nals {
            out.put_slice(&[0, 0, 0, 1]);
            out.put_slice(nal.as_bytes());
        }
        out.freeze()
    }

    /// 以四字节长度前缀拼接（MP4样本格式）
    pub fn to_avcc(&self) -> Bytes {
        let size: usize = self.nals.iter().map(|n| n.len() + 4).sum();
        let mut out = BytesMut::with_capacity(size);
        for nal in &self.nals {
            out.put_u32(nal.len() as u32);
            out.put_slice(nal.as_bytes());
        }
        out.freeze()
    }
}

/// 按NAL序列划分访问单元（H.264 7.4.1.2.3）
#[derive(Debug, Default)]
pub struct AccessUnitAssembler {
    current: Option<AccessUnit>,
    has_vcl: bool,
}

impl AccessUnitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个NAL；若它开启了新的访问单元，返回已完成的上一个
    pub fn push(&mut self, nal: NalUnit, timestamp: f64) -> Option<AccessUnit> {
        let nal_type = nal.nal_type();
        let boundary = self.is_boundary(&nal, first_slice_of_picture);
        let completed = if boundary { self.take() } else { None };

        let au = self.current.get_or_insert_with(|| AccessUnit::new(timestamp));
        au.nals.push(nal);
        self.has_vcl |= nal_type.is_vcl();

        // 序列结束/码流结束关闭当前访问单元
        if matches!(nal_type, NalType::EndOfSequence | NalType::EndOfStream) {
            return self.take();
        }

        completed
    }

    /// 下一个NAL尚未完整到达时，根据其已到达的开头判断当前访问单元是否已结束
    ///
    /// 条带头无法从前缀中解析时不做判断，等待完整的NAL。
    pub fn complete_before(&mut self, next_prefix: &[u8]) -> Option<AccessUnit> {
        let nal = NalUnit::new(Bytes::copy_from_slice(next_prefix))?;
        if self.is_boundary(&nal, |nal| {
            SliceHeader::parse(nal).map_or(false, |h| h.first_mb_in_slice == 0)
        }) {
            self.take()
        } else {
            None
        }
    }

    /// 当前访问单元到此结束
    pub fn finish(&mut self) -> Option<AccessUnit> {
        self.take()
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.has_vcl = false;
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    fn is_boundary(&self, nal: &NalUnit, new_picture: impl Fn(&NalUnit) -> bool) -> bool {
        let nal_type = nal.nal_type();
        match self.current {
            None => false,
            Some(_) if nal_type == NalType::Aud => true,
            Some(_) if self.has_vcl && nal_type.starts_access_unit() => true,
            Some(_) if self.has_vcl && nal_type.is_vcl() => new_picture(nal),
            Some(_) => false,
        }
    }

    fn take(&mut self) -> Option<AccessUnit> {
        self.has_vcl = false;
        self.current.take()
    }
}

/// first_mb_in_slice == 0 表示新图像；条带头损坏时也按新图像处理，使损坏隔离在单个访问单元内
fn first_slice_of_picture(nal: &NalUnit) -> bool {
    match nal.nal_type() {
        NalType::SliceNonIdr | NalType::SliceIdr | NalType::SliceDataPartA => {
            SliceHeader::parse(nal).map_or(true, |h| h.first_mb_in_slice == 0)
        }
        // 数据分区B/C跟随分区A
        _ => false,
    }
}
