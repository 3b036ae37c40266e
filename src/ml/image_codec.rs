//! 画像のデコードと正規化
//!
//! 学習・評価・推論のすべてがこのモジュールを通して画像をテンソル化します。
//! 変換は常に同じ: デコード → RGB化 → 正方形へリサイズ（Triangle）→ [0,1] へスケール。

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::error::{ClassifierError, Result};

/// 標準の入力サイズ
pub const IMAGE_SIZE: usize = 224;

/// リサイズ時の補間方法（学習と推論で共通）
pub const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// 正規化済み画像 (C, H, W) の順で平坦化
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub size: usize,
}

impl ImageTensor {
    /// [1, 3, size, size] のテンソルへ変換
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::<B, 1>::from_floats(self.data.as_slice(), device)
            .reshape([1, 3, self.size, self.size])
    }
}

/// バイト列から画像をデコード（エラー表示用の名前付き）
pub fn decode_dynamic(bytes: &[u8], origin: &str) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(ClassifierError::decode(origin, "empty input"));
    }
    image::load_from_memory(bytes).map_err(|e| ClassifierError::decode(origin, e))
}

/// 3チャネル化して正方形にリサイズ
pub fn to_canonical_rgb(image: &DynamicImage, size: usize) -> RgbImage {
    let size = size as u32;
    let rgb = image.to_rgb8();
    if rgb.width() == size && rgb.height() == size {
        return rgb;
    }
    image::imageops::resize(&rgb, size, size, RESIZE_FILTER)
}

/// RGB画像を [0,1] の (C, H, W) 配列へ
pub fn rgb_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                let pixel = img.get_pixel(x, y);
                data.push(pixel[channel] as f32 / 255.0);
            }
        }
    }

    data
}

/// バイト列から正規化済み画像を作成
pub fn decode_image_bytes(bytes: &[u8], size: usize) -> Result<ImageTensor> {
    decode_named_bytes(bytes, "<memory>", size)
}

fn decode_named_bytes(bytes: &[u8], origin: &str, size: usize) -> Result<ImageTensor> {
    let image = decode_dynamic(bytes, origin)?;
    let rgb = to_canonical_rgb(&image, size);
    Ok(ImageTensor {
        data: rgb_to_chw(&rgb),
        size,
    })
}

/// 画像ファイルから正規化済み画像を作成
pub fn decode_image_path(path: &Path, size: usize) -> Result<ImageTensor> {
    let origin = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|e| ClassifierError::decode(origin.as_str(), e))?;
    decode_named_bytes(&bytes, &origin, size)
}

/// 画像ファイルを読み込んでRGB化・リサイズのみ行う（データ拡張の前段）
pub fn load_canonical_rgb(path: &Path, size: usize) -> Result<RgbImage> {
    let origin = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|e| ClassifierError::decode(origin.as_str(), e))?;
    let image = decode_dynamic(&bytes, &origin)?;
    Ok(to_canonical_rgb(&image, size))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    pub(crate) fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn test_decode_has_canonical_shape_and_range() {
        let img = RgbImage::from_fn(300, 120, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 255]));
        let tensor = decode_image_bytes(&png_bytes(DynamicImage::ImageRgb8(img)), IMAGE_SIZE).unwrap();

        assert_eq!(tensor.size, IMAGE_SIZE);
        assert_eq!(tensor.data.len(), 3 * IMAGE_SIZE * IMAGE_SIZE);
        assert!(tensor.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_grayscale_and_alpha_become_three_channels() {
        let gray = GrayImage::from_pixel(10, 10, Luma([128]));
        let tensor = decode_image_bytes(&png_bytes(DynamicImage::ImageLuma8(gray)), 32).unwrap();
        assert_eq!(tensor.data.len(), 3 * 32 * 32);
        // 全チャネル同じ値
        let plane = 32 * 32;
        assert_eq!(tensor.data[0], tensor.data[plane]);
        assert_eq!(tensor.data[0], tensor.data[2 * plane]);

        let rgba = RgbaImage::from_pixel(32, 32, Rgba([255, 0, 0, 10]));
        let tensor = decode_image_bytes(&png_bytes(DynamicImage::ImageRgba8(rgba)), 32).unwrap();
        assert_eq!(tensor.data.len(), 3 * 32 * 32);
        assert_eq!(tensor.data[0], 1.0);
    }

    #[test]
    fn test_corrupt_bytes_fail_with_decode_error() {
        let err = decode_image_bytes(b"\x89PNG but not really", 32).unwrap_err();
        assert!(matches!(err, ClassifierError::Decode { .. }));

        let err = decode_image_bytes(&[], 32).unwrap_err();
        assert!(matches!(err, ClassifierError::Decode { .. }));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = decode_image_path(Path::new("no/such/water.jpg"), 32).unwrap_err();
        assert!(err.to_string().contains("no/such/water.jpg"));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let img = RgbImage::from_fn(57, 91, |x, y| Rgb([(x * 3) as u8, (y * 2) as u8, 7]));
        let bytes = png_bytes(DynamicImage::ImageRgb8(img));
        let a = decode_image_bytes(&bytes, 64).unwrap();
        let b = decode_image_bytes(&bytes, 64).unwrap();
        assert_eq!(a, b);
    }
}
