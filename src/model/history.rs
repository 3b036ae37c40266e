//! 学習履歴
//!
//! エポックごとの指標を追記し、学習終了時に一度だけ保存します。
//! - history.json: 指標名 → エポック順の値（グラフ描画用）
//! - history.csv : 1行1エポック（フェーズ・学習率付き）

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::model_metadata::TrainingPhase;

/// 1エポック分の指標
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochMetrics {
    /// エポック番号（1始まり、全フェーズ通算）
    pub epoch: usize,
    pub phase: TrainingPhase,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 学習履歴（追記のみ）
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// 指標名 → 値の列
    pub fn to_series(&self) -> BTreeMap<String, Vec<f64>> {
        let mut series = BTreeMap::new();
        series.insert(
            "accuracy".to_string(),
            self.epochs.iter().map(|m| m.accuracy).collect(),
        );
        series.insert("loss".to_string(), self.epochs.iter().map(|m| m.loss).collect());
        series.insert(
            "val_accuracy".to_string(),
            self.epochs.iter().map(|m| m.val_accuracy).collect(),
        );
        series.insert(
            "val_loss".to_string(),
            self.epochs.iter().map(|m| m.val_loss).collect(),
        );
        series
    }

    /// JSON形式で保存
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.to_series())?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// CSV形式で保存
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for metrics in &self.epochs {
            writer.serialize(metrics)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// history.json を読み込む
    pub fn load_series(path: &Path) -> Result<BTreeMap<String, Vec<f64>>> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
