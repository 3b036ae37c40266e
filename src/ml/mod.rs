pub mod image_codec;
pub mod augmentation;
pub mod dataset;
pub mod ml_model;
pub mod callbacks;
pub mod training;
pub mod evaluation;
pub mod inference;

pub use image_codec::{decode_image_bytes, decode_image_path, ImageTensor, IMAGE_SIZE};
pub use augmentation::{AugmentParams, Augmenter};
pub use dataset::{DatasetLoader, ImageBatch, ImageItem, Split, SplitLoader, WaterDataset};
pub use ml_model::{binary_cross_entropy_with_logits, ModelConfig, WaterClassifier};
pub use callbacks::{BestCheckpoint, EarlyStopping, ReduceLrOnPlateau};
pub use training::{train_model, Trainer, TrainerState, TrainingOutcome};
pub use evaluation::{ClassReport, ConfusionMatrix, EvaluationReport, Evaluator};
pub use inference::{ModelHandle, Predictor};
