//! 学習・検証・テスト用データセット
//!
//! ディレクトリ構成:
//! ```text
//! root/
//!   train/<class>/*.png|jpg|...
//!   validation/<class>/...   (または val/、無ければ train/ から切り出し)
//!   test/<class>/...
//! ```
//! クラス番号はクラスフォルダ名の辞書順で決まります（0 = Clean, 1 = Dirty）。
//! 画像はパスのみ保持し、バッチ作成時に読み込みます。

use std::fmt;
use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor};
use burn_dataset::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::augmentation::Augmenter;
use crate::ml::image_codec::{decode_image_path, load_canonical_rgb, rgb_to_chw};
use crate::model::AugmentationSettings;

/// 対応する画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "webp"];

/// 二値分類なのでクラス数は常に2
pub const NUM_CLASSES: usize = 2;

/// データセットの分割
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Validation => write!(f, "validation"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageItem {
    pub path: PathBuf,
    pub label: usize,
}

/// パスとラベルの一覧
#[derive(Debug, Clone)]
pub struct WaterDataset {
    items: Vec<ImageItem>,
    class_names: Vec<String>,
}

impl WaterDataset {
    pub fn new(items: Vec<ImageItem>, class_names: Vec<String>) -> Self {
        Self { items, class_names }
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn items(&self) -> &[ImageItem] {
        &self.items
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for item in &self.items {
            if let Some(c) = counts.get_mut(item.label) {
                *c += 1;
            }
        }
        counts
    }
}

impl Dataset<ImageItem> for WaterDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// 画像ファイルかどうか（拡張子で判定）
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// ディレクトリ直下の画像ファイル（名前順）
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// クラスフォルダ名を辞書順で列挙
pub fn discover_classes(split_dir: &Path) -> Result<Vec<String>> {
    if !split_dir.is_dir() {
        return Err(ClassifierError::dataset(split_dir, "directory does not exist"));
    }

    let mut classes = Vec::new();
    for entry in std::fs::read_dir(split_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ClassifierError::dataset(&path, "invalid directory name"))?
                .to_string();
            classes.push(name);
        }
    }
    classes.sort();
    Ok(classes)
}

/// クラスフォルダ名が Clean/Dirty の並びに見えるか確認（警告のみ）
pub fn check_class_order(class_names: &[String]) {
    let expected = ["clean", "dirty"];
    for (index, (name, keyword)) in class_names.iter().zip(expected).enumerate() {
        if !name.to_lowercase().contains(keyword) {
            warn!(
                "クラス{} のフォルダ名 '{}' に '{}' が含まれていません。ラベルの対応を確認してください",
                index, name, keyword
            );
        }
    }
}

/// 各クラスフォルダの画像を収集
///
/// `class_names` に無いフォルダがあればエラー。
/// `allow_empty` が false なら空のクラスフォルダもエラー。
fn collect_items(split_dir: &Path, class_names: &[String], allow_empty: bool) -> Result<Vec<Vec<PathBuf>>> {
    let mut per_class = vec![Vec::new(); class_names.len()];

    for folder in discover_classes(split_dir)? {
        let label = class_names.iter().position(|n| *n == folder).ok_or_else(|| {
            ClassifierError::dataset(
                split_dir.join(&folder),
                format!("unknown class folder (known classes: {})", class_names.join(", ")),
            )
        })?;

        let class_dir = split_dir.join(&folder);
        let images = list_images(&class_dir)?;
        if images.is_empty() && !allow_empty {
            return Err(ClassifierError::dataset(class_dir, "class folder contains no images"));
        }
        per_class[label] = images;
    }

    Ok(per_class)
}

fn flatten(per_class: Vec<Vec<PathBuf>>) -> Vec<ImageItem> {
    per_class
        .into_iter()
        .enumerate()
        .flat_map(|(label, paths)| paths.into_iter().map(move |path| ImageItem { path, label }))
        .collect()
}

/// クラスごとに検証用を切り出す（層化・シード固定）
///
/// 戻り値は (学習用, 検証用)。両者は重複しない。
pub fn stratified_split(
    per_class: Vec<Vec<PathBuf>>,
    validation_split: f64,
    seed: u64,
) -> (Vec<ImageItem>, Vec<ImageItem>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut validation = Vec::new();

    for (label, mut paths) in per_class.into_iter().enumerate() {
        paths.shuffle(&mut rng);
        let n = paths.len();
        let n_val = if n < 2 {
            0
        } else {
            ((n as f64 * validation_split).round() as usize).clamp(1, n - 1)
        };

        for (i, path) in paths.into_iter().enumerate() {
            let item = ImageItem { path, label };
            if i < n_val {
                validation.push(item);
            } else {
                train.push(item);
            }
        }
    }

    (train, validation)
}

/// データセットの読み込み
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    image_size: usize,
    validation_split: f64,
    seed: u64,
    augmentation: AugmentationSettings,
    /// データ拡張・シャッフル用の乱数シード（None ならエントロピーから）
    shuffle_seed: Option<u64>,
}

impl DatasetLoader {
    pub fn new(image_size: usize, validation_split: f64, seed: u64) -> Self {
        Self {
            image_size,
            validation_split,
            seed,
            augmentation: AugmentationSettings::default(),
            shuffle_seed: None,
        }
    }

    pub fn with_augmentation(mut self, augmentation: AugmentationSettings) -> Self {
        self.augmentation = augmentation;
        self
    }

    pub fn with_shuffle_seed(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    /// 検証用フォルダ（validation/ または val/）
    fn validation_dir(root: &Path) -> Option<PathBuf> {
        ["validation", "val"]
            .iter()
            .map(|name| root.join(name))
            .find(|dir| dir.is_dir())
    }

    /// 学習用のクラス名（train/ から確定）
    pub fn train_classes(root: &Path) -> Result<Vec<String>> {
        let train_dir = root.join("train");
        if !train_dir.is_dir() {
            return Err(ClassifierError::dataset(train_dir, "training directory not found"));
        }
        let classes = discover_classes(&train_dir)?;
        if classes.len() != NUM_CLASSES {
            return Err(ClassifierError::dataset(
                train_dir,
                format!(
                    "expected exactly {} class folders, found {} ({})",
                    NUM_CLASSES,
                    classes.len(),
                    classes.join(", ")
                ),
            ));
        }
        Ok(classes)
    }

    /// 指定した分割を読み込む
    ///
    /// `augment` は学習用分割にのみ効きます。
    pub fn load(&self, root: &Path, split: Split, batch_size: usize, augment: bool) -> Result<SplitLoader> {
        let dataset = match split {
            Split::Train | Split::Validation => self.load_train_or_validation(root, split)?,
            Split::Test => {
                let test_dir = root.join("test");
                let classes = discover_classes(&test_dir)
                    .map_err(|_| ClassifierError::NoTestData(test_dir.clone()))?;
                if classes.is_empty() {
                    return Err(ClassifierError::NoTestData(test_dir));
                }
                if classes.len() != NUM_CLASSES {
                    return Err(ClassifierError::dataset(
                        test_dir,
                        format!("expected exactly {} class folders, found {}", NUM_CLASSES, classes.len()),
                    ));
                }
                self.load_test_with_classes(root, &classes)?
            }
        };

        let augment = augment && split == Split::Train;
        Ok(self.make_loader(dataset, split, batch_size, augment))
    }

    /// 保存済みのクラス対応表でテスト用データを読み込む
    ///
    /// test/ が無い、または画像が1枚も無い場合は `NoTestData`。
    pub fn load_test_with_classes(&self, root: &Path, class_names: &[String]) -> Result<WaterDataset> {
        let test_dir = root.join("test");
        if !test_dir.is_dir() {
            return Err(ClassifierError::NoTestData(test_dir));
        }

        let items = flatten(collect_items(&test_dir, class_names, true)?);
        if items.is_empty() {
            return Err(ClassifierError::NoTestData(test_dir));
        }

        Ok(WaterDataset::new(items, class_names.to_vec()))
    }

    /// 保存済みのクラス対応表でテスト用のバッチ供給を作成（評価用）
    pub fn load_test_split(&self, root: &Path, class_names: &[String], batch_size: usize) -> Result<SplitLoader> {
        let dataset = self.load_test_with_classes(root, class_names)?;
        Ok(self.make_loader(dataset, Split::Test, batch_size, false))
    }

    fn load_train_or_validation(&self, root: &Path, split: Split) -> Result<WaterDataset> {
        let classes = Self::train_classes(root)?;
        let train_dir = root.join("train");
        let train_per_class = collect_items(&train_dir, &classes, false)?;

        let items = match Self::validation_dir(root) {
            Some(val_dir) => match split {
                Split::Validation => {
                    let items = flatten(collect_items(&val_dir, &classes, false)?);
                    if items.is_empty() {
                        return Err(ClassifierError::dataset(val_dir, "validation split is empty"));
                    }
                    items
                }
                _ => flatten(train_per_class),
            },
            None => {
                let (train, validation) =
                    stratified_split(train_per_class, self.validation_split, self.seed);
                if validation.is_empty() {
                    return Err(ClassifierError::dataset(
                        train_dir,
                        "too few images to carve out a validation split",
                    ));
                }
                match split {
                    Split::Validation => validation,
                    _ => train,
                }
            }
        };

        Ok(WaterDataset::new(items, classes))
    }

    fn make_loader(&self, dataset: WaterDataset, split: Split, batch_size: usize, augment: bool) -> SplitLoader {
        let counts = dataset.class_counts();
        info!(
            "{} データ: {} 枚 ({})",
            split,
            dataset.len(),
            dataset
                .class_names()
                .iter()
                .zip(&counts)
                .map(|(name, count)| format!("{}: {}", name, count))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rng = match self.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        SplitLoader {
            dataset,
            split,
            batch_size: batch_size.max(1),
            image_size: self.image_size,
            shuffle: split == Split::Train,
            augmenter: augment.then(|| Augmenter::new(self.augmentation.clone())),
            rng,
        }
    }
}

/// 1分割分のバッチ供給
///
/// `batches()` を呼ぶたびに新しい1周分のイテレータを返します。
pub struct SplitLoader {
    dataset: WaterDataset,
    split: Split,
    batch_size: usize,
    image_size: usize,
    shuffle: bool,
    augmenter: Option<Augmenter>,
    rng: StdRng,
}

impl SplitLoader {
    pub fn dataset(&self) -> &WaterDataset {
        &self.dataset
    }

    pub fn class_names(&self) -> &[String] {
        self.dataset.class_names()
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// 新しい1周を開始
    pub fn batches(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        let rng = StdRng::seed_from_u64(self.rng.gen());

        Batches {
            loader: self,
            order,
            position: 0,
            rng,
        }
    }
}

/// 1周分のバッチイテレータ
///
/// 画像の読み込みに失敗した場合はエラーを1回返して終了します。
pub struct Batches<'a> {
    loader: &'a SplitLoader,
    order: Vec<usize>,
    position: usize,
    rng: StdRng,
}

impl Batches<'_> {
    fn load_item(&mut self, item: &ImageItem) -> Result<Vec<f32>> {
        let size = self.loader.image_size;
        match &self.loader.augmenter {
            Some(augmenter) => {
                let rgb = load_canonical_rgb(&item.path, size)?;
                Ok(rgb_to_chw(&augmenter.augment(&rgb, &mut self.rng)))
            }
            None => Ok(decode_image_path(&item.path, size)?.data),
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }

        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.position..end].to_vec();
        self.position = end;

        let size = self.loader.image_size;
        let mut images = Vec::with_capacity(indices.len() * 3 * size * size);
        let mut labels = Vec::with_capacity(indices.len());

        for index in indices {
            let Some(item) = self.loader.dataset.get(index) else {
                continue;
            };
            match self.load_item(&item) {
                Ok(data) => {
                    images.extend_from_slice(&data);
                    labels.push(item.label);
                }
                Err(e) => {
                    self.position = self.order.len();
                    return Some(Err(e));
                }
            }
        }

        debug!("バッチ作成: {} 枚", labels.len());
        Some(Ok(ImageBatch {
            images,
            labels,
            image_size: size,
        }))
    }
}

/// CPU上のバッチ（C, H, W を連結）
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub images: Vec<f32>,
    pub labels: Vec<usize>,
    pub image_size: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 画像 [n, 3, s, s] と正解 [n, 1]（0.0 / 1.0）
    pub fn to_tensors<B: Backend>(&self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let n = self.len();
        let s = self.image_size;
        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(self.images.as_slice(), device).reshape([n, 3, s, s]);
        let targets: Vec<f32> = self.labels.iter().map(|&l| l as f32).collect();
        let targets = Tensor::<B, 1>::from_floats(targets.as_slice(), device).reshape([n, 1]);
        (images, targets)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;

    /// root/<split>/<class>/img_<i>.png を作成
    pub(crate) fn write_split(root: &Path, split: &str, classes: &[(&str, usize)]) {
        for (class, count) in classes {
            let dir = root.join(split).join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let shade = if class.contains("dirty") { 40 } else { 200 };
                let img = RgbImage::from_pixel(12, 12, Rgb([shade, shade, (i * 10) as u8]));
                img.save(dir.join(format!("img_{}.png", i))).unwrap();
            }
        }
    }

    fn loader() -> DatasetLoader {
        DatasetLoader::new(16, 0.2, 42)
            .with_augmentation(AugmentationSettings::disabled())
            .with_shuffle_seed(3)
    }

    #[test]
    fn test_missing_train_dir_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = loader().load(dir.path(), Split::Train, 4, true).err().unwrap();
        assert!(matches!(err, ClassifierError::Dataset { .. }));
    }

    #[test]
    fn test_classes_are_sorted_lexically() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("dirty water", 5), ("clean water", 5)]);
        let train = loader().load(dir.path(), Split::Train, 4, false).unwrap();
        assert_eq!(train.class_names(), ["clean water", "dirty water"]);
    }

    #[test]
    fn test_three_classes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("clean", 2), ("dirty", 2), ("muddy", 2)]);
        let err = loader().load(dir.path(), Split::Train, 4, false).err().unwrap();
        assert!(matches!(err, ClassifierError::Dataset { .. }));
    }

    #[test]
    fn test_empty_class_folder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("clean", 3)]);
        std::fs::create_dir_all(dir.path().join("train").join("dirty")).unwrap();
        let err = loader().load(dir.path(), Split::Train, 4, false).err().unwrap();
        assert!(err.to_string().contains("no images"));
    }

    #[test]
    fn test_carved_validation_is_disjoint_and_stratified() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("clean", 10), ("dirty", 10)]);

        let train = loader().load(dir.path(), Split::Train, 4, false).unwrap();
        let val = loader().load(dir.path(), Split::Validation, 4, false).unwrap();

        assert_eq!(train.len(), 16);
        assert_eq!(val.len(), 4);
        assert_eq!(val.dataset().class_counts(), vec![2, 2]);

        let train_paths: HashSet<_> = train.dataset().items().iter().map(|i| &i.path).collect();
        assert!(val.dataset().items().iter().all(|i| !train_paths.contains(&i.path)));
    }

    #[test]
    fn test_explicit_validation_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("clean", 4), ("dirty", 4)]);
        write_split(dir.path(), "val", &[("clean", 1), ("dirty", 2)]);

        let train = loader().load(dir.path(), Split::Train, 4, false).unwrap();
        let val = loader().load(dir.path(), Split::Validation, 4, false).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(val.dataset().class_counts(), vec![1, 2]);
    }

    #[test]
    fn test_batches_restart_and_cover_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "train", &[("clean", 5), ("dirty", 5)]);
        write_split(dir.path(), "validation", &[("clean", 1), ("dirty", 1)]);

        let mut train = loader().load(dir.path(), Split::Train, 4, true).unwrap();
        assert_eq!(train.num_batches(), 3);

        for _ in 0..2 {
            let batches: Vec<_> = train.batches().collect::<Result<_>>().unwrap();
            assert_eq!(batches.len(), 3);
            assert_eq!(batches.iter().map(ImageBatch::len).sum::<usize>(), 10);
            let dirty = batches.iter().flat_map(|b| &b.labels).filter(|&&l| l == 1).count();
            assert_eq!(dirty, 5);
        }
    }

    #[test]
    fn test_batch_tensor_shapes() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "test", &[("clean", 2), ("dirty", 1)]);

        let mut test = loader().load(dir.path(), Split::Test, 8, false).unwrap();
        let batch = test.batches().next().unwrap().unwrap();
        let (images, targets) = batch.to_tensors::<CpuBackend>(&Default::default());
        assert_eq!(images.dims(), [3, 3, 16, 16]);
        assert_eq!(targets.dims(), [3, 1]);
        assert_eq!(batch.labels, vec![0, 0, 1]);
    }

    #[test]
    fn test_corrupt_image_surfaces_path() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "test", &[("clean", 1), ("dirty", 1)]);
        let bad = dir.path().join("test").join("dirty").join("broken.jpg");
        std::fs::write(&bad, b"not an image").unwrap();

        let mut test = loader().load(dir.path(), Split::Test, 8, false).unwrap();
        let err = test.batches().next().unwrap().unwrap_err();
        assert!(err.to_string().contains("broken.jpg"));
    }

    #[test]
    fn test_unknown_test_folder_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "test", &[("clean", 1), ("muddy", 1)]);
        let classes = vec!["clean".to_string(), "dirty".to_string()];
        let err = loader().load_test_with_classes(dir.path(), &classes).unwrap_err();
        assert!(matches!(err, ClassifierError::Dataset { .. }));
    }

    #[test]
    fn test_missing_test_dir_is_no_test_data() {
        let dir = tempfile::tempdir().unwrap();
        let classes = vec!["clean".to_string(), "dirty".to_string()];
        let err = loader().load_test_with_classes(dir.path(), &classes).unwrap_err();
        assert!(matches!(err, ClassifierError::NoTestData(_)));
    }

    #[test]
    fn test_empty_test_class_folders_are_no_test_data() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "test", &[("clean", 0), ("dirty", 0)]);
        let classes = vec!["clean".to_string(), "dirty".to_string()];
        let err = loader().load_test_with_classes(dir.path(), &classes).unwrap_err();
        assert!(matches!(err, ClassifierError::NoTestData(_)));

        let err = loader().load(dir.path(), Split::Test, 4, false).err().unwrap();
        assert!(matches!(err, ClassifierError::NoTestData(_)));
    }

    #[test]
    fn test_test_dir_without_class_folders_is_no_test_data() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("test")).unwrap();
        let err = loader().load(dir.path(), Split::Test, 4, false).err().unwrap();
        assert!(matches!(err, ClassifierError::NoTestData(_)));
    }

    #[test]
    fn test_one_empty_test_class_still_loads() {
        let dir = tempfile::tempdir().unwrap();
        write_split(dir.path(), "test", &[("clean", 2), ("dirty", 0)]);
        let classes = vec!["clean".to_string(), "dirty".to_string()];
        let test = loader().load_test_with_classes(dir.path(), &classes).unwrap();
        assert_eq!(test.class_counts(), vec![2, 0]);
    }
}
