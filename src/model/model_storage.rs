//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス対応表、入力サイズ、検証指標など）
//! - model.bin       - モデルの重み（バイナリ）

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::{debug, info};

use crate::error::{ClassifierError, Result};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先のパスを正規化（.tar.gz で終わっていなければ拡張子を追加）
pub fn artifact_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, bytes)
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 一時ファイルに書き出してからリネームするため、同じパスの既存モデルは
/// 書き込み完了まで読み込み可能なまま残ります。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let temp_path = tar_gz_path.with_extension("gz.partial");
    {
        let tar_gz_file = File::create(&temp_path)?;
        let encoder = GzEncoder::new(tar_gz_file, Compression::default());
        let mut tar_builder = Builder::new(encoder);

        let json_str = metadata.to_json_string()?;
        append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
        append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

        // tarアーカイブとgzipストリームを完成させる
        let encoder = tar_builder.into_inner()?;
        encoder.finish()?;
    }
    std::fs::rename(&temp_path, &tar_gz_path)?;

    debug!(
        "モデルを保存しました: {} ({} バイト)",
        tar_gz_path.display(),
        model_binary.len()
    );
    Ok(tar_gz_path)
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    if !tar_gz_path.is_file() {
        return Err(ClassifierError::ModelNotFound(tar_gz_path.to_path_buf()));
    }
    let tar_gz_file = File::open(tar_gz_path)?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;
    let entries = archive
        .entries()
        .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
        let is_metadata = entry
            .path()
            .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?
            .to_str()
            == Some(METADATA_ENTRY);

        if is_metadata {
            let mut json_str = String::new();
            entry
                .read_to_string(&mut json_str)
                .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
            let metadata = ModelMetadata::from_json_string(&json_str)
                .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
            metadata
                .validate()
                .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
            return Ok(metadata);
        }
    }

    Err(ClassifierError::artifact(
        tar_gz_path,
        "metadata.json not found in tar.gz archive",
    ))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;
    let entries = archive
        .entries()
        .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in entries {
        let mut entry = entry.map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
        let name = entry
            .path()
            .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?
            .to_string_lossy()
            .into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry
                    .read_to_string(&mut json_str)
                    .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
                metadata_opt = Some(
                    ModelMetadata::from_json_string(&json_str)
                        .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?,
                );
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => {
            metadata
                .validate()
                .map_err(|e| ClassifierError::artifact(tar_gz_path, e))?;
            Ok((metadata, binary))
        }
        (None, _) => Err(ClassifierError::artifact(
            tar_gz_path,
            "metadata.json not found in tar.gz archive",
        )),
        (_, None) => Err(ClassifierError::artifact(
            tar_gz_path,
            "model.bin not found in tar.gz archive",
        )),
    }
}

/// メタデータをログに出す
pub fn print_metadata_info(metadata: &ModelMetadata) {
    info!("=== モデルメタデータ ===");
    info!("クラス対応: 0 = {}, 1 = {}", metadata.class_names[0], metadata.class_names[1]);
    info!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    info!("バックボーン幅倍率: {}", metadata.width_multiplier);
    info!("学習フェーズ: {} (エポック {})", metadata.phase, metadata.epoch);
    info!(
        "検証精度: {:.2}%, 検証損失: {:.4}",
        metadata.val_accuracy * 100.0,
        metadata.val_loss
    );
    info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ModelConfig;
    use crate::model::model_metadata::TrainingPhase;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            vec!["clean".to_string(), "dirty".to_string()],
            &ModelConfig::new().with_image_size(64),
            TrainingPhase::FineTuning,
            7,
            0.9,
            0.2,
        )
    }

    #[test]
    fn test_save_then_load_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_model_with_metadata(
            &dir.path().join("nested").join("best_model"),
            &metadata(),
            &[1, 2, 3, 4],
        )
        .unwrap();
        assert!(saved.to_string_lossy().ends_with("best_model.tar.gz"));

        let (loaded, binary) = load_model_with_metadata(&saved).unwrap();
        assert_eq!(binary, vec![1, 2, 3, 4]);
        assert_eq!(loaded.image_size, 64);
        assert_eq!(loaded.phase, TrainingPhase::FineTuning);

        let only_metadata = load_metadata(&saved).unwrap();
        assert_eq!(only_metadata.epoch, 7);
    }

    #[test]
    fn test_missing_artifact_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_model_with_metadata(&dir.path().join("final_model.tar.gz")).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelNotFound(_)));
    }

    #[test]
    fn test_corrupt_artifact_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(matches!(err, ClassifierError::Artifact { .. }));
    }
}
