//! エラー定義
//!
//! 学習・評価・推論の各経路で発生するエラーを一つの列挙型にまとめます。
//! どのエラーもパス情報を保持し、呼び出し元へそのまま伝播します。

use std::path::PathBuf;

use thiserror::Error;

/// 分類器ライブラリのエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// 画像が壊れている、または未対応の形式（単一リクエストのみ失敗）
    #[error("failed to decode image '{origin}': {reason}")]
    Decode { origin: String, reason: String },

    /// データセットのディレクトリ構成が不正（学習開始前に中断）
    #[error("dataset error at '{}': {reason}", .path.display())]
    Dataset { path: PathBuf, reason: String },

    /// モデルファイルが存在しない
    #[error("model artifact not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    /// テスト用データが存在しない、または空
    #[error("no test data found under '{}'", .0.display())]
    NoTestData(PathBuf),

    /// 設定値が不正
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 学習中の致命的エラー（NaN損失など）
    #[error("training failed at epoch {epoch}: {reason}")]
    Training { epoch: usize, reason: String },

    /// モデルファイルの中身が不正
    #[error("invalid model artifact '{}': {reason}", .path.display())]
    Artifact { path: PathBuf, reason: String },

    /// メタデータ・履歴のシリアライズ失敗
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClassifierError {
    pub fn decode(origin: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }

    pub fn dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Artifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<csv::Error> for ClassifierError {
    fn from(err: csv::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_path() {
        let err = ClassifierError::dataset("data/water/train", "train/ directory is missing");
        let message = err.to_string();
        assert!(message.contains("data/water/train"));
        assert!(message.contains("missing"));
    }

    #[test]
    fn test_model_not_found_display() {
        let err = ClassifierError::ModelNotFound(PathBuf::from("models/best_model.tar.gz"));
        assert_eq!(
            err.to_string(),
            "model artifact not found: models/best_model.tar.gz"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ClassifierError = io.into();
        assert!(matches!(err, ClassifierError::Io(_)));
    }
}
