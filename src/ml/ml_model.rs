//! 水質分類モデルの定義
//!
//! 事前学習済みの特徴抽出器（MobileNet系の深さ方向分離畳み込み）に、
//! 小さな二値分類ヘッドを載せた転移学習モデルです。

use std::path::Path;

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    record::{BinBytesRecorder, DefaultFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use tracing::{debug, info};

use crate::error::{self, ClassifierError};

/// バックボーンのステム出力チャネル
const STEM_CHANNELS: usize = 32;

/// 深さ方向分離畳み込みブロック（出力チャネル, ストライド）
const BLOCKS: [(usize, usize); 13] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// バックボーンのチャネル倍率
    #[config(default = 1.0)]
    pub width_multiplier: f64,
    /// 中間層のユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// GAP直後のドロップアウト率
    #[config(default = 0.3)]
    pub feature_dropout: f64,
    /// 中間層後のドロップアウト率
    #[config(default = 0.2)]
    pub hidden_dropout: f64,
    /// ヘッド学習中はバックボーンを固定する
    #[config(default = true)]
    pub freeze_backbone: bool,
}

impl ModelConfig {
    /// 倍率を掛けたチャネル数
    pub fn scaled(&self, channels: usize) -> usize {
        ((channels as f64 * self.width_multiplier).round() as usize).max(8)
    }

    /// バックボーンの出力チャネル数
    pub fn feature_channels(&self) -> usize {
        self.scaled(1024)
    }

    /// バックボーンのみ初期化
    pub fn init_backbone<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let stem_out = self.scaled(STEM_CHANNELS);
        let stem = ConvBnBlock::new(3, stem_out, 3, 2, 1, device);

        let mut blocks = Vec::with_capacity(BLOCKS.len());
        let mut in_channels = stem_out;
        for (out, stride) in BLOCKS {
            let out_channels = self.scaled(out);
            blocks.push(DepthwiseSeparable::new(in_channels, out_channels, stride, device));
            in_channels = out_channels;
        }

        Backbone { stem, blocks }
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> WaterClassifier<B> {
        let features = self.feature_channels();

        debug!("[Model] 入力サイズ: {}x{}", self.image_size, self.image_size);
        debug!("[Model] バックボーン出力: {} チャネル (倍率 {})", features, self.width_multiplier);
        debug!("[Model] ヘッド: {} -> {} -> 1", features, self.hidden_units);

        WaterClassifier {
            backbone: self.init_backbone(device),
            head: ClassifierHead {
                global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                feature_dropout: DropoutConfig::new(self.feature_dropout).init(),
                hidden: LinearConfig::new(features, self.hidden_units).init(device),
                hidden_dropout: DropoutConfig::new(self.hidden_dropout).init(),
                output: LinearConfig::new(self.hidden_units, 1).init(device),
                activation: Relu::new(),
            },
        }
    }
}

/// Conv + BatchNorm + ReLU6
#[derive(Module, Debug)]
pub struct ConvBnBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBnBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        x.clamp(0.0, 6.0)
    }
}

/// 深さ方向 3x3 → 点方向 1x1
#[derive(Module, Debug)]
pub struct DepthwiseSeparable<B: Backend> {
    depthwise: ConvBnBlock<B>,
    pointwise: ConvBnBlock<B>,
}

impl<B: Backend> DepthwiseSeparable<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            depthwise: ConvBnBlock::new(in_channels, in_channels, 3, stride, in_channels, device),
            pointwise: ConvBnBlock::new(in_channels, out_channels, 1, 1, 1, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pointwise.forward(self.depthwise.forward(x))
    }
}

/// 特徴抽出器
///
/// 入力 [batch, 3, s, s] → 特徴マップ [batch, 1024α, s/32, s/32]
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: ConvBnBlock<B>,
    blocks: Vec<DepthwiseSeparable<B>>,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(self.stem.forward(images), |x, block| block.forward(x))
    }
}

/// 分類ヘッド
///
/// GAP → Dropout → Dense + ReLU → Dropout → Dense(1)
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    global_pool: AdaptiveAvgPool2d,
    feature_dropout: Dropout,
    hidden: Linear<B>,
    hidden_dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.global_pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.feature_dropout.forward(x);
        let x = self.activation.forward(self.hidden.forward(x));
        let x = self.hidden_dropout.forward(x);
        self.output.forward(x)
    }
}

/// 水質分類モデル
///
/// # アーキテクチャ
/// - ステム: Conv 3x3 stride 2 + BN + ReLU6
/// - 深さ方向分離畳み込み x 13
/// - GAP → Dropout(0.3) → FC 128 + ReLU → Dropout(0.2) → FC 1
/// - Sigmoid（確率を求める時のみ）
#[derive(Module, Debug)]
pub struct WaterClassifier<B: Backend> {
    backbone: Backbone<B>,
    head: ClassifierHead<B>,
}

impl<B: Backend> WaterClassifier<B> {
    /// 順伝播
    ///
    /// # 戻り値
    /// - ロジット [batch_size, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Dirty である確率 [batch_size, 1]
    pub fn forward_probability(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// 事前学習済みのバックボーン重みを読み込む
    ///
    /// burnのレコードファイル（`.mpk`）を想定しています。拡張子は `.mpk` に置き換えて読みます。
    pub fn load_backbone_weights(self, path: &Path, device: &B::Device) -> error::Result<Self> {
        let record_path = path.with_extension("mpk");
        if !record_path.is_file() {
            return Err(ClassifierError::ModelNotFound(record_path));
        }

        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        let backbone = self
            .backbone
            .load_file(path, &recorder, device)
            .map_err(|e| ClassifierError::artifact(path, format!("{:?}", e)))?;

        info!("バックボーンの重みを読み込みました: {}", path.display());
        Ok(Self {
            backbone,
            head: self.head,
        })
    }

    /// 重みをバイト列へ（f32精度）
    pub fn to_bytes(&self) -> error::Result<Vec<u8>> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        recorder
            .record(self.clone().into_record(), ())
            .map_err(|e| ClassifierError::Serialization(format!("{:?}", e)))
    }

    /// バイト列から重みを復元
    pub fn load_bytes(self, bytes: Vec<u8>, device: &B::Device) -> error::Result<Self> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(bytes, device)
            .map_err(|e| ClassifierError::Serialization(format!("{:?}", e)))?;
        Ok(self.load_record(record))
    }
}

impl<B: AutodiffBackend> WaterClassifier<B> {
    /// 学習用の順伝播
    ///
    /// `freeze_backbone` が真の場合、バックボーンは自動微分なしの推論モードで実行します。
    /// 勾配はヘッドにのみ流れ、BatchNormの統計量も更新されません。
    pub fn forward_train(&self, images: Tensor<B, 4>, freeze_backbone: bool) -> Tensor<B, 2> {
        let features = if freeze_backbone {
            let features = self.backbone.valid().forward(images.inner());
            Tensor::from_inner(features)
        } else {
            self.backbone.forward(images)
        };
        self.head.forward(features)
    }
}

/// ロジットに対する二値交差エントロピー（平均）
///
/// max(x, 0) - x*y + log(1 + exp(-|x|))
pub fn binary_cross_entropy_with_logits<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let positive = logits.clone().clamp_min(0.0);
    let cross = logits.clone() * targets;
    let soft = logits.abs().neg().exp().add_scalar(1.0).log();
    (positive - cross + soft).mean()
}

/// 確率テンソルをCPUの配列へ
pub fn probabilities_to_vec<B: Backend>(probabilities: Tensor<B, 2>) -> error::Result<Vec<f32>> {
    probabilities
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| ClassifierError::Serialization(format!("{:?}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, Train};
    use burn::optim::{AdamConfig, GradientsParams, Optimizer};

    fn small_config() -> ModelConfig {
        ModelConfig::new().with_image_size(32).with_width_multiplier(0.25).with_hidden_units(8)
    }

    #[test]
    fn test_model_config_file_round_trip() {
        assert!(ModelConfig::new().freeze_backbone);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_config.json");
        small_config().with_freeze_backbone(false).save(&path).unwrap();

        let loaded = ModelConfig::load(&path).unwrap();
        assert_eq!(loaded.image_size, 32);
        assert_eq!(loaded.hidden_units, 8);
        assert!(!loaded.freeze_backbone);
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = small_config().init::<CpuBackend>(&device);
        let images = Tensor::<CpuBackend, 4>::ones([2, 3, 32, 32], &device);

        assert_eq!(model.forward(images.clone()).dims(), [2, 1]);

        let probs = probabilities_to_vec(model.forward_probability(images)).unwrap();
        assert_eq!(probs.len(), 2);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_width_multiplier_scales_channels() {
        assert_eq!(ModelConfig::new().feature_channels(), 1024);
        assert_eq!(small_config().feature_channels(), 256);
        assert_eq!(small_config().scaled(32), 8);
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let device = Default::default();
        let logits = Tensor::<CpuBackend, 2>::from_floats([[0.0], [2.0]], &device);
        let targets = Tensor::<CpuBackend, 2>::from_floats([[1.0], [0.0]], &device);
        let loss: f32 = binary_cross_entropy_with_logits(logits, targets).into_scalar();

        // (ln 2 + (2 + ln(1 + e^-2))) / 2
        let expected = ((2f32).ln() + 2.0 + (1.0 + (-2f32).exp()).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_frozen_backbone_is_not_updated() {
        let device = Default::default();
        let model = small_config().init::<Train<CpuBackend>>(&device);
        let before = model.backbone().clone().valid().into_record();
        let before = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(before, ())
            .unwrap();

        let images = Tensor::<Train<CpuBackend>, 4>::random(
            [2, 3, 32, 32],
            burn::tensor::Distribution::Default,
            &device,
        );
        let targets = Tensor::<Train<CpuBackend>, 2>::from_floats([[0.0], [1.0]], &device);

        let mut optimizer = AdamConfig::new().init();
        let loss = binary_cross_entropy_with_logits(model.forward_train(images, true), targets);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optimizer.step(1e-2, model, grads);

        let after = BinBytesRecorder::<FullPrecisionSettings>::default()
            .record(model.backbone().clone().valid().into_record(), ())
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_bytes_round_trip_restores_outputs() {
        let device = Default::default();
        let config = small_config();
        let model = config.init::<CpuBackend>(&device);
        let bytes = model.to_bytes().unwrap();

        let restored = config.init::<CpuBackend>(&device).load_bytes(bytes, &device).unwrap();
        let images = Tensor::<CpuBackend, 4>::ones([1, 3, 32, 32], &device);
        let a = probabilities_to_vec(model.forward_probability(images.clone())).unwrap();
        let b = probabilities_to_vec(restored.forward_probability(images)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_backbone_weights_is_model_not_found() {
        let device = Default::default();
        let model = small_config().init::<CpuBackend>(&device);
        let err = model
            .load_backbone_weights(Path::new("no/such/backbone.mpk"), &device)
            .unwrap_err();
        assert!(matches!(err, ClassifierError::ModelNotFound(_)));
    }

    #[test]
    fn test_backbone_weights_without_mpk_file_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        std::fs::write(&path, b"not a record").unwrap();

        let device = Default::default();
        let err = small_config()
            .init::<CpuBackend>(&device)
            .load_backbone_weights(&path, &device)
            .unwrap_err();
        match err {
            ClassifierError::ModelNotFound(missing) => assert_eq!(missing, path.with_extension("mpk")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_backbone_weights_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = small_config();
        let source = config.init::<CpuBackend>(&device);
        let path = dir.path().join("backbone");
        source
            .backbone()
            .clone()
            .save_file(&path, &DefaultFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        let loaded = config
            .init::<CpuBackend>(&device)
            .load_backbone_weights(&path.with_extension("mpk"), &device)
            .unwrap();
        let images = Tensor::<CpuBackend, 4>::ones([1, 3, 32, 32], &device);
        let a = source.backbone().forward(images.clone()).into_data();
        let b = loaded.backbone().forward(images).into_data();
        assert_eq!(a, b);
    }
}
