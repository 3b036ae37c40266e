//! モデルメタデータの定義
//!
//! tar.gz形式で保存されるモデルに同梱する情報です。
//!
//! ## クラス対応表
//! 学習時に確定したクラスフォルダ名（辞書順）をそのまま `class_names` として保存します。
//! 評価・推論時はこの表だけを参照し、ディレクトリを再走査してクラス番号を決め直すことはしません。

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, Result};
use crate::ml::ModelConfig;

/// 現在のメタデータ形式
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// 学習フェーズ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    /// バックボーン凍結、ヘッドのみ学習
    HeadTraining,
    /// バックボーン解凍後の追加学習
    FineTuning,
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingPhase::HeadTraining => write!(f, "head_training"),
            TrainingPhase::FineTuning => write!(f, "fine_tuning"),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// メタデータ形式のバージョン
    pub format_version: u32,

    /// クラス名（インデックス順、0 = Clean, 1 = Dirty）
    /// 例: ["clean", "dirty"]
    pub class_names: Vec<String>,

    /// モデル入力サイズ（正方形）
    pub image_size: usize,

    /// バックボーンのチャネル倍率
    pub width_multiplier: f64,

    /// 中間層のユニット数
    pub hidden_units: usize,

    /// ドロップアウト率（推論時は無効だが、構成を復元するため保存）
    pub feature_dropout: f64,
    pub hidden_dropout: f64,

    /// 保存時点の学習フェーズ
    pub phase: TrainingPhase,

    /// 保存時点のエポック（1始まり、全フェーズ通算）
    pub epoch: usize,

    /// 保存時点の検証精度・損失
    pub val_accuracy: f64,
    pub val_loss: f64,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        model_config: &ModelConfig,
        phase: TrainingPhase,
        epoch: usize,
        val_accuracy: f64,
        val_loss: f64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: METADATA_FORMAT_VERSION,
            class_names,
            image_size: model_config.image_size,
            width_multiplier: model_config.width_multiplier,
            hidden_units: model_config.hidden_units,
            feature_dropout: model_config.feature_dropout,
            hidden_dropout: model_config.hidden_dropout,
            phase,
            epoch,
            val_accuracy,
            val_loss,
            trained_at,
        }
    }

    /// 保存されている構成からモデル設定を復元
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new()
            .with_image_size(self.image_size)
            .with_width_multiplier(self.width_multiplier)
            .with_hidden_units(self.hidden_units)
            .with_feature_dropout(self.feature_dropout)
            .with_hidden_dropout(self.hidden_dropout)
    }

    /// 二値分類として読み込めるかを検証
    pub fn validate(&self) -> Result<()> {
        if self.format_version != METADATA_FORMAT_VERSION {
            return Err(ClassifierError::Serialization(format!(
                "unsupported metadata format version {}",
                self.format_version
            )));
        }
        if self.class_names.len() != 2 {
            return Err(ClassifierError::Serialization(format!(
                "expected exactly 2 class names, found {}",
                self.class_names.len()
            )));
        }
        if self.class_names[0] == self.class_names[1] {
            return Err(ClassifierError::Serialization(
                "class names must be distinct".to_string(),
            ));
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
