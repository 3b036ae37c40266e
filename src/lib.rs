//! 水質画像分類ライブラリ
//!
//! 水面の画像を Clean / Dirty に分類する転移学習モデルの、学習・評価・推論パイプラインです。
//!
//! - [`ml::train_model`]: データセットから学習し、best_model / final_model を保存
//! - [`ml::Evaluator`]: test/ で正解率・混同行列・クラス別指標を算出
//! - [`ml::Predictor`]: 画像1枚を分類して [`types::PredictionResult`] を返す

pub mod error;
pub mod logging;
pub mod backend;
pub mod types;
pub mod model;
pub mod ml;

pub use error::{ClassifierError, Result};
pub use types::{PredictionResult, WaterLabel};
