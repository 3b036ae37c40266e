//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・モデル構成・学習ハイパーパラメータ・データ拡張をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{ClassifierError, Result};

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Wgpu
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バックボーンのチャネル倍率
    pub width_multiplier: f64,
    /// 事前学習済みバックボーンの重みファイル（burnのレコード形式）
    #[serde(default)]
    pub backbone_weights: Option<String>,
    /// GAP直後のドロップアウト率
    pub feature_dropout: f64,
    /// 中間層のユニット数
    pub hidden_units: usize,
    /// 中間層後のドロップアウト率
    pub hidden_dropout: f64,
    /// ヘッド学習中はバックボーンを固定する
    #[serde(default = "default_true")]
    pub freeze_backbone: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            image_size: 224,
            width_multiplier: 1.0,
            backbone_weights: None,
            feature_dropout: 0.3,
            hidden_units: 128,
            hidden_dropout: 0.2,
            freeze_backbone: true,
        }
    }
}

/// ファインチューニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneSettings {
    /// バックボーンを解凍して追加学習するか
    pub enabled: bool,
    /// 追加エポック数
    pub epochs: usize,
    /// 学習率（ヘッド学習よりかなり小さくする）
    pub learning_rate: f64,
}

impl Default for FineTuneSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            epochs: 10,
            learning_rate: 1e-5,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（検証データの切り出しに使用）
    pub seed: u64,
    /// validation/ が無い場合に train/ から切り出す割合
    pub validation_split: f64,
    /// 早期終了までの猶予エポック数（val_loss基準）
    pub early_stopping_patience: usize,
    /// 学習率を下げるまでの猶予エポック数（val_loss基準）
    pub lr_decay_patience: usize,
    /// 学習率の減衰係数
    pub lr_decay_factor: f64,
    /// 学習率の下限
    pub min_learning_rate: f64,
    /// ファインチューニング
    #[serde(default)]
    pub fine_tune: FineTuneSettings,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 32,
            learning_rate: 1e-4,
            seed: 42,
            validation_split: 0.2,
            early_stopping_patience: 5,
            lr_decay_patience: 3,
            lr_decay_factor: 0.5,
            min_learning_rate: 1e-7,
            fine_tune: FineTuneSettings::default(),
        }
    }
}

/// データ拡張設定（学習データのみに適用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentationSettings {
    /// 回転角の範囲（±度）
    pub rotation_degrees: f32,
    /// 水平移動の範囲（画像幅に対する割合）
    pub width_shift: f32,
    /// 垂直移動の範囲（画像高さに対する割合）
    pub height_shift: f32,
    /// 左右反転（50%）
    pub horizontal_flip: bool,
    /// 明るさ倍率の範囲
    pub brightness_range: (f32, f32),
    /// せん断の範囲（±係数）
    pub shear: f32,
    /// ズームの範囲（±割合）
    pub zoom: f32,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_degrees: 15.0,
            width_shift: 0.1,
            height_shift: 0.1,
            horizontal_flip: true,
            brightness_range: (0.8, 1.2),
            shear: 0.05,
            zoom: 0.1,
        }
    }
}

impl AugmentationSettings {
    /// 何も変化させない設定
    pub fn disabled() -> Self {
        Self {
            rotation_degrees: 0.0,
            width_shift: 0.0,
            height_shift: 0.0,
            horizontal_flip: false,
            brightness_range: (1.0, 1.0),
            shear: 0.0,
            zoom: 0.0,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    pub device_type: DeviceType,
    /// データセットのルート（train/ と test/ を含む）
    pub dataset_dir: String,
    /// モデル・学習履歴の出力先
    pub output_dir: String,
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// データ拡張設定
    #[serde(default)]
    pub augmentation: AugmentationSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            dataset_dir: "data/water images".to_string(),
            output_dir: "models".to_string(),
            model: ModelSettings::default(),
            training: TrainingSettings::default(),
            augmentation: AugmentationSettings::default(),
        }
    }
}

/// 最良モデルのファイル名
pub const BEST_MODEL_NAME: &str = "best_model.tar.gz";
/// 最終モデルのファイル名
pub const FINAL_MODEL_NAME: &str = "final_model.tar.gz";
/// 学習履歴（JSON）のファイル名
pub const HISTORY_JSON_NAME: &str = "history.json";
/// 学習履歴（CSV）のファイル名
pub const HISTORY_CSV_NAME: &str = "history.csv";

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 学習を始める前に設定値を検証する
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        let m = &self.model;

        if t.num_epochs == 0 {
            return Err(ClassifierError::Config("num_epochs must be at least 1".into()));
        }
        if t.batch_size == 0 {
            return Err(ClassifierError::Config("batch_size must be at least 1".into()));
        }
        if !(t.learning_rate > 0.0) || !(t.min_learning_rate > 0.0) {
            return Err(ClassifierError::Config("learning rates must be positive".into()));
        }
        if !(t.validation_split > 0.0 && t.validation_split < 1.0) {
            return Err(ClassifierError::Config(format!(
                "validation_split must be in (0, 1), got {}",
                t.validation_split
            )));
        }
        if t.early_stopping_patience == 0 {
            return Err(ClassifierError::Config(
                "early_stopping_patience must be at least 1".into(),
            ));
        }
        if t.lr_decay_patience == 0 || t.lr_decay_patience >= t.early_stopping_patience {
            return Err(ClassifierError::Config(format!(
                "lr_decay_patience ({}) must be in 1..early_stopping_patience ({})",
                t.lr_decay_patience, t.early_stopping_patience
            )));
        }
        if !(t.lr_decay_factor > 0.0 && t.lr_decay_factor < 1.0) {
            return Err(ClassifierError::Config(format!(
                "lr_decay_factor must be in (0, 1), got {}",
                t.lr_decay_factor
            )));
        }
        if t.fine_tune.enabled && (t.fine_tune.epochs == 0 || !(t.fine_tune.learning_rate > 0.0)) {
            return Err(ClassifierError::Config(
                "fine_tune needs at least one epoch and a positive learning rate".into(),
            ));
        }
        if m.image_size < 32 {
            return Err(ClassifierError::Config(format!(
                "image_size must be at least 32, got {}",
                m.image_size
            )));
        }
        if !(m.width_multiplier > 0.0) || m.hidden_units == 0 {
            return Err(ClassifierError::Config(
                "width_multiplier and hidden_units must be positive".into(),
            ));
        }
        for dropout in [m.feature_dropout, m.hidden_dropout] {
            if !(0.0..1.0).contains(&dropout) {
                return Err(ClassifierError::Config(format!(
                    "dropout must be in [0, 1), got {}",
                    dropout
                )));
            }
        }
        let (lo, hi) = self.augmentation.brightness_range;
        if !(lo > 0.0 && lo <= hi) {
            return Err(ClassifierError::Config(format!(
                "brightness_range must satisfy 0 < low <= high, got ({}, {})",
                lo, hi
            )));
        }
        Ok(())
    }

    /// 最良モデルの保存先
    pub fn best_model_path(&self) -> PathBuf {
        Path::new(&self.output_dir).join(BEST_MODEL_NAME)
    }

    /// 最終モデルの保存先
    pub fn final_model_path(&self) -> PathBuf {
        Path::new(&self.output_dir).join(FINAL_MODEL_NAME)
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("データセット: {}", self.dataset_dir);
        info!("出力先: {}", self.output_dir);
        info!(
            "入力サイズ: {}x{}, 幅倍率: {}",
            self.model.image_size, self.model.image_size, self.model.width_multiplier
        );
        match &self.model.backbone_weights {
            Some(path) => info!("バックボーン重み: {}", path),
            None => info!("バックボーン重み: なし（ランダム初期化）"),
        }
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}",
            self.training.num_epochs, self.training.batch_size, self.training.learning_rate
        );
        info!(
            "早期終了: patience={}, 学習率減衰: patience={} factor={}",
            self.training.early_stopping_patience,
            self.training.lr_decay_patience,
            self.training.lr_decay_factor
        );
        if self.training.fine_tune.enabled {
            info!(
                "ファインチューニング: {} エポック, 学習率 {}",
                self.training.fine_tune.epochs, self.training.fine_tune.learning_rate
            );
        }
    }
}
