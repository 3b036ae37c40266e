//! 学習データ用のデータ拡張
//!
//! 回転・平行移動・せん断・ズームを一つのアフィン変換にまとめ、逆写像＋双線形補間で適用します。
//! 画像外を参照した場合は最も近い端の画素で埋めます（nearest）。
//! その後、左右反転と明るさ調整を行います。
//!
//! サンプルごと・エポックごとに乱数を引き直すため、同じ画像でも毎回異なる結果になります。

use image::{Rgb, RgbImage};
use rand::Rng;

use crate::model::AugmentationSettings;

/// 1枚分の変換パラメータ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    /// 回転角（ラジアン）
    pub rotation: f32,
    /// 平行移動（ピクセル）
    pub shift_x: f32,
    pub shift_y: f32,
    /// せん断係数
    pub shear: f32,
    /// ズーム倍率（1.0で等倍、>1で縮小表示）
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip: bool,
    pub brightness: f32,
}

impl AugmentParams {
    pub fn identity() -> Self {
        Self {
            rotation: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            shear: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
            brightness: 1.0,
        }
    }

    fn is_geometric_identity(&self) -> bool {
        self.rotation == 0.0
            && self.shift_x == 0.0
            && self.shift_y == 0.0
            && self.shear == 0.0
            && self.zoom_x == 1.0
            && self.zoom_y == 1.0
    }
}

/// データ拡張器
#[derive(Debug, Clone)]
pub struct Augmenter {
    settings: AugmentationSettings,
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &AugmentationSettings {
        &self.settings
    }

    /// 画像サイズに応じて変換パラメータを抽選
    pub fn sample_params<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> AugmentParams {
        let s = &self.settings;
        let symmetric = |rng: &mut R, range: f32| {
            if range > 0.0 {
                rng.gen_range(-range..=range)
            } else {
                0.0
            }
        };

        let rotation = symmetric(rng, s.rotation_degrees).to_radians();
        let shift_x = symmetric(rng, s.width_shift) * width as f32;
        let shift_y = symmetric(rng, s.height_shift) * height as f32;
        let shear = symmetric(rng, s.shear);
        let zoom_x = 1.0 + symmetric(rng, s.zoom);
        let zoom_y = 1.0 + symmetric(rng, s.zoom);
        let flip = s.horizontal_flip && rng.gen_bool(0.5);
        let (lo, hi) = s.brightness_range;
        let brightness = if hi > lo { rng.gen_range(lo..=hi) } else { lo };

        AugmentParams {
            rotation,
            shift_x,
            shift_y,
            shear,
            zoom_x,
            zoom_y,
            flip,
            brightness,
        }
    }

    /// ランダムな拡張を適用
    pub fn augment<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample_params(image.width(), image.height(), rng);
        apply(image, &params)
    }
}

/// 指定パラメータで変換を適用
pub fn apply(image: &RgbImage, params: &AugmentParams) -> RgbImage {
    let mut out = if params.is_geometric_identity() {
        image.clone()
    } else {
        warp_affine(image, params)
    };

    if params.flip {
        image::imageops::flip_horizontal_in_place(&mut out);
    }

    if params.brightness != 1.0 {
        for pixel in out.pixels_mut() {
            for c in 0..3 {
                pixel[c] = (pixel[c] as f32 * params.brightness).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

/// 出力画素 → 入力座標の逆写像で変換する
///
/// src = center + R(θ)·Shear·Zoom·(dst - center) + shift
fn warp_affine(image: &RgbImage, params: &AugmentParams) -> RgbImage {
    let (width, height) = image.dimensions();
    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;

    let (sin, cos) = params.rotation.sin_cos();
    // Shear·Zoom
    let a = params.zoom_x;
    let b = params.shear * params.zoom_y;
    let d = params.zoom_y;
    // R·(Shear·Zoom)
    let m00 = cos * a;
    let m01 = cos * b - sin * d;
    let m10 = sin * a;
    let m11 = sin * b + cos * d;

    RgbImage::from_fn(width, height, |x, y| {
        let qx = x as f32 - cx;
        let qy = y as f32 - cy;
        let sx = m00 * qx + m01 * qy + cx + params.shift_x;
        let sy = m10 * qx + m11 * qy + cy + params.shift_y;
        sample_bilinear(image, sx, sy)
    })
}

/// 双線形補間（範囲外は端の画素）
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);

    let x0 = x.floor();
    let y0 = y.floor();
    let x1 = (x0 + 1.0).min(max_x);
    let y1 = (y0 + 1.0).min(max_y);
    let fx = x - x0;
    let fy = y - y0;

    let p00 = image.get_pixel(x0 as u32, y0 as u32);
    let p10 = image.get_pixel(x1 as u32, y0 as u32);
    let p01 = image.get_pixel(x0 as u32, y1 as u32);
    let p11 = image.get_pixel(x1 as u32, y1 as u32);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn gradient(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| Rgb([(x * 8) as u8, (y * 8) as u8, 100]))
    }

    #[test]
    fn test_identity_keeps_pixels() {
        let img = gradient(16);
        assert_eq!(apply(&img, &AugmentParams::identity()), img);
    }

    #[test]
    fn test_disabled_settings_never_change_image() {
        let augmenter = Augmenter::new(AugmentationSettings::disabled());
        let img = gradient(16);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            assert_eq!(augmenter.augment(&img, &mut rng), img);
        }
    }

    #[test]
    fn test_sampled_params_stay_in_range() {
        let augmenter = Augmenter::new(AugmentationSettings::default());
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..200 {
            let p = augmenter.sample_params(224, 224, &mut rng);
            assert!(p.rotation.abs() <= 15f32.to_radians() + 1e-6);
            assert!(p.shift_x.abs() <= 22.4 + 1e-3);
            assert!(p.shift_y.abs() <= 22.4 + 1e-3);
            assert!(p.shear.abs() <= 0.05 + 1e-6);
            assert!((0.9..=1.1).contains(&p.zoom_x));
            assert!((0.9..=1.1).contains(&p.zoom_y));
            assert!((0.8..=1.2).contains(&p.brightness));
        }
    }

    #[test]
    fn test_flip_mirrors_columns() {
        let img = gradient(8);
        let params = AugmentParams {
            flip: true,
            ..AugmentParams::identity()
        };
        let out = apply(&img, &params);
        assert_eq!(out.get_pixel(0, 3), img.get_pixel(7, 3));
    }

    #[test]
    fn test_brightness_saturates() {
        let img = RgbImage::from_pixel(4, 4, Rgb([200, 100, 0]));
        let params = AugmentParams {
            brightness: 1.5,
            ..AugmentParams::identity()
        };
        let out = apply(&img, &params);
        assert_eq!(*out.get_pixel(0, 0), Rgb([255, 150, 0]));
    }

    #[test]
    fn test_shift_fills_with_edge_pixels() {
        let img = gradient(16);
        let params = AugmentParams {
            shift_x: 100.0,
            ..AugmentParams::identity()
        };
        let out = apply(&img, &params);
        // 右端の列で埋まる
        assert_eq!(out.get_pixel(0, 5), img.get_pixel(15, 5));
    }
}
