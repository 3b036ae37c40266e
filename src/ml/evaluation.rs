//! テストデータでのモデル評価
//!
//! test/ の画像をデータ拡張なしで推論し、正解率・混同行列・クラス別の適合率/再現率/F1を求めます。
//! テスト用フォルダ名はモデルに保存されたクラス対応表で解決します。

use std::fmt;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::ml::dataset::DatasetLoader;
use crate::ml::inference::ModelHandle;
use crate::types::WaterLabel;

/// 評価時のバッチサイズ
pub const EVAL_BATCH_SIZE: usize = 32;

/// 2x2 混同行列 `[実際][予測]`（順序は [Clean, Dirty]）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub matrix: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    pub fn from_labels(actual: &[WaterLabel], predicted: &[WaterLabel]) -> Self {
        let mut cm = Self::default();
        for (a, p) in actual.iter().zip(predicted) {
            cm.add(*a, *p);
        }
        cm
    }

    pub fn add(&mut self, actual: WaterLabel, predicted: WaterLabel) {
        self.matrix[actual.index()][predicted.index()] += 1;
    }

    pub fn get(&self, actual: WaterLabel, predicted: WaterLabel) -> usize {
        self.matrix[actual.index()][predicted.index()]
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        self.matrix[0][0] + self.matrix[1][1]
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// クラス別の指標
    pub fn class_report(&self, label: WaterLabel, class_name: &str) -> ClassReport {
        let tp = self.get(label, label);
        let other = WaterLabel::ALL[1 - label.index()];
        let fp = self.get(other, label);
        let fn_ = self.get(label, other);

        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        ClassReport {
            label,
            class_name: class_name.to_string(),
            precision,
            recall,
            f1,
            support: tp + fn_,
        }
    }
}

/// 分母0は 0.0
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// クラス別の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    pub label: WaterLabel,
    /// 学習時のフォルダ名
    pub class_name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 評価結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model_path: PathBuf,
    pub total_samples: usize,
    pub accuracy: f64,
    pub confusion_matrix: ConfusionMatrix,
    pub per_class: Vec<ClassReport>,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
}

impl EvaluationReport {
    pub fn from_confusion_matrix(
        model_path: PathBuf,
        confusion_matrix: ConfusionMatrix,
        class_names: &[String],
    ) -> Self {
        let per_class: Vec<ClassReport> = WaterLabel::ALL
            .iter()
            .map(|&label| {
                let name = class_names
                    .get(label.index())
                    .map(String::as_str)
                    .unwrap_or(label.as_str());
                confusion_matrix.class_report(label, name)
            })
            .collect();

        let n = per_class.len() as f64;
        let macro_precision = per_class.iter().map(|c| c.precision).sum::<f64>() / n;
        let macro_recall = per_class.iter().map(|c| c.recall).sum::<f64>() / n;
        let macro_f1 = per_class.iter().map(|c| c.f1).sum::<f64>() / n;

        Self {
            model_path,
            total_samples: confusion_matrix.total(),
            accuracy: confusion_matrix.accuracy(),
            confusion_matrix,
            per_class,
            macro_precision,
            macro_recall,
            macro_f1,
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON形式で保存
    pub fn save_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model: {}", self.model_path.display())?;
        writeln!(f, "Test accuracy: {:.2}% ({} samples)", self.accuracy * 100.0, self.total_samples)?;
        writeln!(f)?;
        writeln!(f, "Confusion matrix (rows = actual, columns = predicted):")?;
        writeln!(f, "{:>12} {:>8} {:>8}", "", "Clean", "Dirty")?;
        for label in WaterLabel::ALL {
            let row = self.confusion_matrix.matrix[label.index()];
            writeln!(f, "{:>12} {:>8} {:>8}", label.as_str(), row[0], row[1])?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>12} {:>10} {:>10} {:>10} {:>10}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for class in &self.per_class {
            writeln!(
                f,
                "{:>12} {:>10.4} {:>10.4} {:>10.4} {:>10}",
                class.label.as_str(),
                class.precision,
                class.recall,
                class.f1,
                class.support
            )?;
        }
        write!(
            f,
            "{:>12} {:>10.4} {:>10.4} {:>10.4} {:>10}",
            "macro avg", self.macro_precision, self.macro_recall, self.macro_f1, self.total_samples
        )
    }
}

/// 評価器
pub struct Evaluator<'a, B: Backend> {
    handle: &'a ModelHandle<B>,
    batch_size: usize,
}

impl<'a, B: Backend> Evaluator<'a, B> {
    pub fn new(handle: &'a ModelHandle<B>) -> Self {
        Self {
            handle,
            batch_size: EVAL_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// `data_root/test/` で評価
    ///
    /// test/ が無い、または空なら `NoTestData`。
    pub fn evaluate<P: AsRef<Path>>(&self, data_root: P) -> Result<EvaluationReport> {
        let class_names = &self.handle.metadata().class_names;
        let loader = DatasetLoader::new(self.handle.image_size(), 0.0, 0);
        let mut test = loader.load_test_split(data_root.as_ref(), class_names, self.batch_size)?;

        let mut cm = ConfusionMatrix::default();
        for batch in test.batches() {
            let batch = batch?;
            let (images, _) = batch.to_tensors::<B>(self.handle.device());
            let probabilities = self.handle.probabilities(images)?;

            for (&p, &label) in probabilities.iter().zip(&batch.labels) {
                if let Some(actual) = WaterLabel::from_index(label) {
                    cm.add(actual, WaterLabel::from_probability(p as f64));
                }
            }
        }

        let report =
            EvaluationReport::from_confusion_matrix(self.handle.path().to_path_buf(), cm, class_names);
        info!(
            "評価完了: 正解率 {:.2}% ({} 枚)",
            report.accuracy * 100.0,
            report.total_samples
        );
        Ok(report)
    }
}
