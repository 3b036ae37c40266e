//! モデル推論機能
//!
//! 読み込んだモデルは `ModelHandle` として呼び出し側が所有します（グローバル変数は使いません）。
//! 1度読み込んで使い回し、不要になったら破棄してください。

use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor};
use tracing::{debug, info};

use crate::error::{ClassifierError, Result};
use crate::ml::image_codec::{decode_image_bytes, decode_image_path};
use crate::ml::ml_model::{probabilities_to_vec, WaterClassifier};
use crate::model::{load_model_with_metadata, InferenceConfig, ModelMetadata};
use crate::types::PredictionResult;

/// 読み込み済みモデル
///
/// 自動微分なしのバックエンドで保持するため、ドロップアウトは無効で結果は決定的です。
pub struct ModelHandle<B: Backend> {
    model: WaterClassifier<B>,
    metadata: ModelMetadata,
    config: InferenceConfig,
    device: B::Device,
    path: PathBuf,
}

impl<B: Backend> ModelHandle<B> {
    /// モデルファイル（tar.gz）を読み込む
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let path = model_path.as_ref();
        let (metadata, model_binary) = load_model_with_metadata(path)?;
        let config = InferenceConfig::from_metadata(&metadata);

        // モデルの重みを復元
        let model = metadata
            .model_config()
            .init::<B>(&device)
            .load_bytes(model_binary, &device)
            .map_err(|e| ClassifierError::artifact(path, e))?;

        info!(
            "モデルを読み込みました: {} (エポック {}, val_acc {:.4})",
            path.display(),
            metadata.epoch,
            metadata.val_accuracy
        );

        Ok(Self {
            model,
            metadata,
            config,
            device,
            path: path.to_path_buf(),
        })
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// InferenceConfigへの参照を取得
    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    /// 画像バッチ [n, 3, s, s] の Dirty 確率
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Result<Vec<f32>> {
        probabilities_to_vec(self.model.forward_probability(images))
    }
}

/// 推論器
pub struct Predictor<'a, B: Backend> {
    handle: &'a ModelHandle<B>,
}

impl<'a, B: Backend> Predictor<'a, B> {
    pub fn new(handle: &'a ModelHandle<B>) -> Self {
        Self { handle }
    }

    fn predict_tensor(&self, images: Tensor<B, 4>) -> Result<PredictionResult> {
        let probabilities = self.handle.probabilities(images)?;
        let probability = probabilities.first().copied().ok_or_else(|| {
            ClassifierError::artifact(self.handle.path(), "model produced no output")
        })?;
        Ok(PredictionResult::from_probability(probability as f64))
    }

    /// 画像のバイト列を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
        let image = decode_image_bytes(bytes, self.handle.image_size())?;
        let result = self.predict_tensor(image.to_tensor::<B>(self.handle.device()))?;
        debug!("推論結果: {} (p={:.4})", result.label, result.probability);
        Ok(result)
    }

    /// 単一画像ファイルを分類
    pub fn predict_path<P: AsRef<Path>>(&self, image_path: P) -> Result<PredictionResult> {
        let image = decode_image_path(image_path.as_ref(), self.handle.image_size())?;
        let result = self.predict_tensor(image.to_tensor::<B>(self.handle.device()))?;
        debug!(
            "推論結果: {} -> {} (p={:.4})",
            image_path.as_ref().display(),
            result.label,
            result.probability
        );
        Ok(result)
    }

    /// 複数画像を分類（最初の失敗で中断）
    pub fn predict_many(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<PredictionResult>> {
        let mut results = Vec::with_capacity(image_paths.len());

        for path in image_paths {
            results.push(self.predict_path(path)?);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::ml::image_codec::tests::png_bytes;
    use crate::ml::ModelConfig;
    use crate::model::{save_model_with_metadata, TrainingPhase};
    use crate::types::WaterLabel;
    use image::{DynamicImage, Rgb, RgbImage};

    fn saved_model(dir: &Path) -> PathBuf {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_image_size(32)
            .with_width_multiplier(0.25)
            .with_hidden_units(8);
        let model = config.init::<CpuBackend>(&device);
        let metadata = ModelMetadata::new(
            vec!["clean".to_string(), "dirty".to_string()],
            &config,
            TrainingPhase::HeadTraining,
            1,
            0.5,
            0.69,
        );
        save_model_with_metadata(&dir.join("model"), &metadata, &model.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_missing_model_is_model_not_found() {
        let err = ModelHandle::<CpuBackend>::load("no/such/model.tar.gz", Default::default())
            .err()
            .unwrap();
        assert!(matches!(err, ClassifierError::ModelNotFound(_)));
    }

    #[test]
    fn test_prediction_is_deterministic_and_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ModelHandle::<CpuBackend>::load(saved_model(dir.path()), Default::default()).unwrap();
        assert_eq!(handle.image_size(), 32);

        let predictor = Predictor::new(&handle);
        let img = RgbImage::from_fn(50, 40, |x, y| Rgb([(x * 5) as u8, (y * 6) as u8, 90]));
        let bytes = png_bytes(DynamicImage::ImageRgb8(img));

        let a = predictor.predict_bytes(&bytes).unwrap();
        let b = predictor.predict_bytes(&bytes).unwrap();
        assert_eq!(a.probability.to_bits(), b.probability.to_bits());
        assert_eq!(a, b);

        assert!((0.0..=1.0).contains(&a.probability));
        assert!((50.0..=100.0).contains(&a.confidence));
        assert_eq!(a.label, WaterLabel::from_probability(a.probability));
    }

    #[test]
    fn test_predict_many_matches_single_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ModelHandle::<CpuBackend>::load(saved_model(dir.path()), Default::default()).unwrap();
        let predictor = Predictor::new(&handle);

        let paths: Vec<PathBuf> = (0..2)
            .map(|i| {
                let path = dir.path().join(format!("sample_{}.png", i));
                RgbImage::from_pixel(20, 20, Rgb([i * 100, 50, 50])).save(&path).unwrap();
                path
            })
            .collect();

        let many = predictor.predict_many(&paths).unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[1], predictor.predict_path(&paths[1]).unwrap());
    }

    #[test]
    fn test_corrupt_image_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ModelHandle::<CpuBackend>::load(saved_model(dir.path()), Default::default()).unwrap();
        let err = Predictor::new(&handle).predict_bytes(b"garbage").unwrap_err();
        assert!(matches!(err, ClassifierError::Decode { .. }));
    }
}
