// JPEG解码与像素格式转换（YUV为BT.601有限范围）

use crate::error::DecodeError;
use crate::frame::PixelFormat;
use bytes::Bytes;
use image::ImageFormat;

/// 解码后的图像
#[derive(Debug)]
pub struct DecodedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// 解码一幅完整的JPEG图像为 `format`
pub fn decode_jpeg(data: &[u8], format: PixelFormat) -> Result<DecodedImage, DecodeError> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| DecodeError::Codec(format!("JPEG: {}", e)))?;
    let (width, height) = (image.width(), image.height());

    let pixels = match format {
        PixelFormat::Gray8 => image.into_luma8().into_raw(),
        PixelFormat::Bgr24 => rgb_to_bgr(image.into_rgb8().into_raw()),
        PixelFormat::Yuv420p => rgb_to_yuv420p(image.into_rgb8().as_raw(), width, height),
        PixelFormat::H264 | PixelFormat::Mjpeg => {
            return Err(DecodeError::Codec(format!("cannot decode JPEG to {:?}", format)))
        }
    };

    Ok(DecodedImage {
        data: Bytes::from(pixels),
        width,
        height,
    })
}

pub fn rgb_to_bgr(mut rgb: Vec<u8>) -> Vec<u8> {
    for pixel in rgb.chunks_exact_mut(3) {
        pixel.swap(0, 2);
    }
    rgb
}

/// 紧密排列的RGB24转平面YUV420P；奇数宽高时色度平面向上取整
pub fn rgb_to_yuv420p(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
    let mut out = vec![0u8; w * h + 2 * cw * ch];
    let (luma, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

    let pixel = |row: usize, col: usize| {
        let i = (row * w + col) * 3;
        (rgb[i] as i32, rgb[i + 1] as i32, rgb[i + 2] as i32)
    };

    for row in 0..h {
        for col in 0..w {
            let (r, g, b) = pixel(row, col);
            luma[row * w + col] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }

    for crow in 0..ch {
        for ccol in 0..cw {
            // 2x2块取平均
            let (mut r, mut g, mut b, mut n) = (0, 0, 0, 0);
            for row in crow * 2..(crow * 2 + 2).min(h) {
                for col in ccol * 2..(ccol * 2 + 2).min(w) {
                    let (pr, pg, pb) = pixel(row, col);
                    r += pr;
                    g += pg;
                    b += pb;
                    n += 1;
                }
            }
            let (r, g, b) = (r / n, g / n, b / n);
            u_plane[crow * cw + ccol] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            v_plane[crow * cw + ccol] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb(color));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn close_to(actual: u8, expected: u8) -> bool {
        (actual as i32 - expected as i32).abs() <= 12
    }

    #[test]
    fn test_decode_jpeg_to_each_format() {
        let data = jpeg(16, 8, [200, 60, 30]);

        let bgr = decode_jpeg(&data, PixelFormat::Bgr24).unwrap();
        assert_eq!((bgr.width, bgr.height), (16, 8));
        assert_eq!(bgr.data.len(), 16 * 8 * 3);
        assert!(close_to(bgr.data[0], 30) && close_to(bgr.data[2], 200));

        let gray = decode_jpeg(&data, PixelFormat::Gray8).unwrap();
        assert_eq!(gray.data.len(), 16 * 8);
        assert!(close_to(gray.data[0], 88));

        let yuv = decode_jpeg(&data, PixelFormat::Yuv420p).unwrap();
        assert_eq!(yuv.data.len(), 16 * 8 + 2 * 8 * 4);
        assert!(close_to(yuv.data[0], 101));
        assert!(close_to(yuv.data[16 * 8], 94));
        assert!(close_to(yuv.data[16 * 8 + 8 * 4], 191));
    }

    #[test]
    fn test_decode_rejects_garbage_and_compressed_targets() {
        assert!(decode_jpeg(&[0xFF, 0xD8, 0xFF, 0xD9], PixelFormat::Bgr24).is_err());

        let data = jpeg(8, 8, [0, 0, 0]);
        assert!(decode_jpeg(&data, PixelFormat::H264).is_err());
    }

    #[test]
    fn test_yuv_layout_for_odd_sizes() {
        let rgb = vec![255u8; 5 * 3 * 3];
        let yuv = rgb_to_yuv420p(&rgb, 5, 3);
        assert_eq!(yuv.len(), 15 + 2 * 3 * 2);
        // 白色：Y=235，色度居中
        assert!(yuv[..15].iter().all(|&y| y == 235));
        assert!(yuv[15..].iter().all(|&c| c == 128));
    }

    #[test]
    fn test_rgb_to_bgr() {
        assert_eq!(rgb_to_bgr(vec![1, 2, 3, 4, 5, 6]), vec![3, 2, 1, 6, 5, 4]);
    }
}
