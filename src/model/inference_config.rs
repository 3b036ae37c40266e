//! モデルメタデータを使用した推論設定
//!
//! 保存されたモデルメタデータを読み込んで推論に必要な情報を取得します。

use tracing::info;

use crate::model::model_metadata::ModelMetadata;
use crate::types::{WaterLabel, DECISION_THRESHOLD};

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// 学習時のクラスフォルダ名（インデックス順）
    pub class_names: Vec<String>,

    /// モデル入力解像度
    pub image_size: usize,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_names: metadata.class_names.clone(),
            image_size: metadata.image_size,
        }
    }

    /// ラベルに対応する学習時のフォルダ名
    pub fn class_name_for_label(&self, label: WaterLabel) -> Option<&str> {
        self.class_names.get(label.index()).map(String::as_str)
    }

    /// 設定情報をログに出す
    pub fn print_info(&self) {
        info!("=== 推論設定 ===");
        for label in WaterLabel::ALL {
            info!(
                "  {} <- フォルダ '{}'",
                label,
                self.class_name_for_label(label).unwrap_or("?")
            );
        }
        info!("モデル入力サイズ: {}x{}", self.image_size, self.image_size);
        info!("閾値: {} 以上を Dirty と判定", DECISION_THRESHOLD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelConfig;
    use crate::model::TrainingPhase;

    #[test]
    fn test_class_names_follow_metadata() {
        let metadata = ModelMetadata::new(
            vec!["clean water".to_string(), "dirty water".to_string()],
            &ModelConfig::new().with_image_size(96),
            TrainingPhase::HeadTraining,
            1,
            0.5,
            0.7,
        );
        let config = InferenceConfig::from_metadata(&metadata);
        assert_eq!(config.image_size, 96);
        assert_eq!(config.class_name_for_label(WaterLabel::Clean), Some("clean water"));
        assert_eq!(config.class_name_for_label(WaterLabel::Dirty), Some("dirty water"));
    }
}
