use super::{Codec, Picture};
use crate::error::DecodeError;
use crate::frame::PixelFormat;
use crate::h264::{AccessUnit, ParameterSets, SliceHeader};

/// 不解码像素：校验条带与参考关系后，按SPS分辨率输出整个访问单元
#[derive(Debug, Default)]
pub struct PassthroughCodec {
    has_reference: bool,
}

impl PassthroughCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for PassthroughCodec {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn decode(&mut self, au: &AccessUnit, params: &ParameterSets) -> Result<Vec<Picture>, DecodeError> {
        let mut resolution = None;
        let mut inter = false;

        for nal in au.vcl_units() {
            let header = SliceHeader::parse(nal)?;
            let (_, sps) = params.resolve(&header)?;
            resolution.get_or_insert((sps.width, sps.height));
            inter |= header.slice_type.is_inter();
        }

        let Some((width, height)) = resolution else {
            return Ok(Vec::new());
        };

        let keyframe = au.is_keyframe();
        if keyframe {
            self.has_reference = true;
        } else if inter && !self.has_reference {
            return Err(DecodeError::MissingReference);
        } else if !inter {
            // 非IDR的I帧同样可作为参考
            self.has_reference = true;
        }

        Ok(vec![Picture {
            data: au.to_annex_b(),
            width,
            height,
            format: PixelFormat::H264,
            timestamp: au.timestamp,
            keyframe,
        }])
    }

    fn flush(&mut self) -> Result<Vec<Picture>, DecodeError> {
        Ok(Vec::new())
    }

    fn reset(&mut self) {
        self.has_reference = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::NalUnit;

    fn au(nals: &[&[u8]], timestamp: f64) -> AccessUnit {
        let mut au = AccessUnit::new(timestamp);
        for bytes in nals {
            au.nals.push(NalUnit::new(bytes.to_vec()).unwrap());
        }
        au
    }

    fn params() -> ParameterSets {
        let mut params = ParameterSets::new();
        for bytes in [
            &[0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8][..],
            &[0x68, 0xCE, 0x38, 0x80][..],
        ] {
            params.update(&NalUnit::new(bytes.to_vec()).unwrap()).unwrap();
        }
        params
    }

    #[test]
    fn test_p_slice_needs_reference() {
        let mut codec = PassthroughCodec::new();
        let params = params();

        let p = au(&[&[0x41, 0x9A, 0x21, 0x40]], 0.0);
        assert_eq!(codec.decode(&p, &params), Err(DecodeError::MissingReference));

        let idr = au(&[&[0x65, 0x88, 0x84, 0x21, 0xA0]], 1.0);
        let pictures = codec.decode(&idr, &params).unwrap();
        assert_eq!(pictures.len(), 1);
        assert_eq!((pictures[0].width, pictures[0].height), (320, 240));
        assert!(pictures[0].keyframe);

        assert_eq!(codec.decode(&p, &params).unwrap().len(), 1);

        codec.reset();
        assert_eq!(codec.decode(&p, &params), Err(DecodeError::MissingReference));
    }

    #[test]
    fn test_unknown_pps() {
        let mut codec = PassthroughCodec::new();
        let idr = au(&[&[0x65, 0x88, 0x84, 0x21, 0xA0]], 0.0);
        assert_eq!(
            codec.decode(&idr, &ParameterSets::new()),
            Err(DecodeError::UnknownPps(0))
        );
    }

    #[test]
    fn test_output_is_annex_b() {
        let mut codec = PassthroughCodec::new();
        let idr = au(&[&[0x65, 0x88, 0x84, 0x21, 0xA0]], 2.5);
        let picture = codec.decode(&idr, &params()).unwrap().remove(0);
        assert_eq!(&picture.data[..5], &[0, 0, 0, 1, 0x65]);
        assert_eq!(picture.timestamp, 2.5);
        assert_eq!(picture.format, PixelFormat::H264);
    }
}
