//! H.264 Annex B 码流处理：起始码扫描、访问单元划分、参数集解析

pub mod access_unit;
pub mod bits;
pub mod nal;
pub mod params;

pub use access_unit::{AccessUnit, AccessUnitAssembler};
pub use nal::{split_annex_b, NalScanner, NalType, NalUnit, ScannedNal};
pub use params::{ParameterSets, Pps, SliceHeader, SliceType, Sps};
