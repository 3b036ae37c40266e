//! モデル学習
//!
//! 状態遷移: Idle → HeadTraining → (FineTuning) → Saved
//!
//! - HeadTraining: バックボーンを凍結してヘッドのみ学習。早期終了と学習率減衰あり。
//! - FineTuning : バックボーンを解凍し、小さい学習率で決まったエポック数だけ追加学習。
//! - 各エポック後に val_accuracy が最高を更新したら best_model を上書き。
//! - 最後に final_model と学習履歴を保存。

use std::fmt;
use std::path::{Path, PathBuf};

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::ml::callbacks::{BestCheckpoint, EarlyStopping, ReduceLrOnPlateau};
use crate::ml::dataset::{check_class_order, DatasetLoader, Split, SplitLoader};
use crate::ml::ml_model::{
    binary_cross_entropy_with_logits, probabilities_to_vec, ModelConfig, WaterClassifier,
};
use crate::model::config::{HISTORY_CSV_NAME, HISTORY_JSON_NAME};
use crate::model::{
    save_model_with_metadata, AppConfig, EpochMetrics, ModelMetadata, TrainingHistory,
    TrainingPhase, TrainingSettings,
};
use crate::types::WaterLabel;

/// 学習の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    HeadTraining,
    FineTuning,
    Saved,
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerState::Idle => write!(f, "Idle"),
            TrainerState::HeadTraining => write!(f, "HeadTraining"),
            TrainerState::FineTuning => write!(f, "FineTuning"),
            TrainerState::Saved => write!(f, "Saved"),
        }
    }
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub best_model_path: PathBuf,
    pub final_model_path: PathBuf,
    pub history_json_path: PathBuf,
    pub history_csv_path: PathBuf,
    pub class_names: Vec<String>,
    pub head_epochs: usize,
    pub fine_tune_epochs: usize,
    pub best_epoch: usize,
    pub best_val_accuracy: f64,
    pub early_stopped: bool,
    pub final_learning_rate: f64,
    pub history: TrainingHistory,
}

/// 1エポック分の平均損失と正解率
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Default)]
struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl MetricAccumulator {
    fn add(&mut self, batch_loss: f64, batch_size: usize, correct: usize) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    fn finish(&self) -> EpochStats {
        if self.total == 0 {
            return EpochStats::default();
        }
        EpochStats {
            loss: self.loss_sum / self.total as f64,
            accuracy: self.correct as f64 / self.total as f64,
        }
    }
}

/// 閾値 0.5 で判定した正解数
pub fn count_correct(probabilities: &[f32], labels: &[usize]) -> usize {
    probabilities
        .iter()
        .zip(labels)
        .filter(|(&p, &label)| WaterLabel::from_probability(p as f64).index() == label)
        .count()
}

/// 自動微分なしで検証データを評価
pub fn validate_model<B: Backend>(
    model: &WaterClassifier<B>,
    loader: &mut SplitLoader,
    device: &B::Device,
) -> Result<EpochStats> {
    let mut acc = MetricAccumulator::default();
    for batch in loader.batches() {
        let batch = batch?;
        let (images, targets) = batch.to_tensors::<B>(device);
        let logits = model.forward(images);
        let loss: f64 = binary_cross_entropy_with_logits(logits.clone(), targets)
            .into_scalar()
            .elem();
        let probabilities = probabilities_to_vec(sigmoid(logits))?;
        acc.add(loss, batch.len(), count_correct(&probabilities, &batch.labels));
    }
    Ok(acc.finish())
}

/// 学習器
pub struct Trainer<'a, B: AutodiffBackend> {
    config: &'a AppConfig,
    device: B::Device,
    model_config: ModelConfig,
    state: TrainerState,
    history: TrainingHistory,
    checkpoint: BestCheckpoint,
    class_names: Vec<String>,
    output_dir: PathBuf,
}

impl<'a, B: AutodiffBackend> Trainer<'a, B> {
    pub fn new(config: &'a AppConfig, device: B::Device) -> Self {
        let m = &config.model;
        let model_config = ModelConfig::new()
            .with_image_size(m.image_size)
            .with_width_multiplier(m.width_multiplier)
            .with_hidden_units(m.hidden_units)
            .with_feature_dropout(m.feature_dropout)
            .with_hidden_dropout(m.hidden_dropout)
            .with_freeze_backbone(m.freeze_backbone);

        Self {
            config,
            device,
            model_config,
            state: TrainerState::Idle,
            history: TrainingHistory::new(),
            checkpoint: BestCheckpoint::new(),
            class_names: Vec::new(),
            output_dir: PathBuf::from(&config.output_dir),
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    fn transition(&mut self, next: TrainerState) {
        info!("学習状態: {} → {}", self.state, next);
        self.state = next;
    }

    /// 学習を実行
    ///
    /// `progress_callback` はエポックごとに呼ばれます。
    pub fn run<F>(mut self, mut progress_callback: F) -> Result<TrainingOutcome>
    where
        F: FnMut(&EpochMetrics),
    {
        // === Idle: 事前チェック ===
        self.config.validate()?;
        let (mut train_loader, mut val_loader) = self.load_datasets()?;
        let model = self.build_model()?;
        std::fs::create_dir_all(&self.output_dir)?;

        let config = self.config;
        let training = &config.training;
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}",
            training.num_epochs, training.batch_size, training.learning_rate
        );

        // === HeadTraining ===
        self.transition(TrainerState::HeadTraining);
        let head = self.train_head(model, &mut train_loader, &mut val_loader, &mut progress_callback)?;
        let mut model = head.model;
        let mut final_lr = head.learning_rate;
        let mut last = head.last;

        // === FineTuning ===
        let mut fine_tune_epochs = 0;
        if training.fine_tune.enabled {
            self.transition(TrainerState::FineTuning);
            let tuned = self.fine_tune(
                model,
                head.epochs_run,
                &mut train_loader,
                &mut val_loader,
                &mut progress_callback,
            )?;
            model = tuned.model;
            final_lr = tuned.learning_rate;
            last = tuned.last;
            fine_tune_epochs = tuned.epochs_run;
        }

        // === Saved ===
        let final_model_path = self.config.final_model_path();
        self.save_artifact(&model, &final_model_path, &last)?;
        info!("最終モデルを保存しました: {}", final_model_path.display());

        let history_json_path = self.output_dir.join(HISTORY_JSON_NAME);
        let history_csv_path = self.output_dir.join(HISTORY_CSV_NAME);
        self.history.save_json(&history_json_path)?;
        self.history.save_csv(&history_csv_path)?;
        info!("学習履歴を保存しました: {}", history_json_path.display());
        self.transition(TrainerState::Saved);

        Ok(TrainingOutcome {
            best_model_path: self.config.best_model_path(),
            final_model_path,
            history_json_path,
            history_csv_path,
            class_names: self.class_names.clone(),
            head_epochs: head.epochs_run,
            fine_tune_epochs,
            best_epoch: self.checkpoint.best_epoch().unwrap_or(0),
            best_val_accuracy: self.checkpoint.best_accuracy().unwrap_or(0.0),
            early_stopped: head.early_stopped,
            final_learning_rate: final_lr,
            history: self.history,
        })
    }

    fn load_datasets(&mut self) -> Result<(SplitLoader, SplitLoader)> {
        let config = self.config;
        let root = PathBuf::from(&config.dataset_dir);
        let training = &config.training;
        info!("データセット: {}", root.display());

        let loader = DatasetLoader::new(
            self.model_config.image_size,
            training.validation_split,
            training.seed,
        )
        .with_augmentation(config.augmentation.clone());

        let train_loader = loader.load(&root, Split::Train, training.batch_size, true)?;
        let val_loader = loader.load(&root, Split::Validation, training.batch_size, false)?;

        self.class_names = train_loader.class_names().to_vec();
        check_class_order(&self.class_names);
        for (index, name) in self.class_names.iter().enumerate() {
            info!("  クラス {}: {}", index, name);
        }

        Ok((train_loader, val_loader))
    }

    fn build_model(&self) -> Result<WaterClassifier<B>> {
        let model = self.model_config.init::<B>(&self.device);
        match &self.config.model.backbone_weights {
            Some(path) => model.load_backbone_weights(Path::new(path), &self.device),
            None => {
                warn!("バックボーンの重みが指定されていません。ランダム初期化で学習します");
                Ok(model)
            }
        }
    }

    fn train_head<F>(
        &mut self,
        mut model: WaterClassifier<B>,
        train_loader: &mut SplitLoader,
        val_loader: &mut SplitLoader,
        progress_callback: &mut F,
    ) -> Result<PhaseResult<B>>
    where
        F: FnMut(&EpochMetrics),
    {
        let config = self.config;
        let training = &config.training;
        let mut optimizer = AdamConfig::new().init::<B, WaterClassifier<B>>();
        let mut schedule = HeadSchedule::new(training);

        let freeze = freeze_for_head(
            self.model_config.freeze_backbone,
            config.model.backbone_weights.is_some(),
        );
        if self.model_config.freeze_backbone && !freeze {
            warn!("バックボーンの重みが無いため、凍結せずにモデル全体を学習します");
        }

        let mut epochs_run = 0;
        let mut last = None;
        let mut early_stopped = false;

        for epoch in 1..=training.num_epochs {
            let (trained, train_stats) =
                self.train_epoch(model, &mut optimizer, train_loader, schedule.learning_rate, freeze, epoch)?;
            let val_stats = validate_model(&trained.valid(), val_loader, &self.device)?;
            epochs_run = epoch;

            let metrics = self.record_epoch(
                epoch,
                TrainingPhase::HeadTraining,
                train_stats,
                val_stats,
                schedule.learning_rate,
                progress_callback,
            );

            match self.finish_head_epoch(trained, &metrics, &mut schedule)? {
                HeadStep::Continue(next) => {
                    model = next;
                    last = Some(metrics);
                }
                HeadStep::Stop {
                    model: restored,
                    metrics: restored_metrics,
                } => {
                    model = restored;
                    last = Some(restored_metrics);
                    early_stopped = true;
                    break;
                }
            }
        }

        let last = last.ok_or_else(|| ClassifierError::Training {
            epoch: 0,
            reason: "no epoch was run".to_string(),
        })?;

        Ok(PhaseResult {
            model,
            epochs_run,
            learning_rate: schedule.learning_rate,
            last,
            early_stopped,
        })
    }

    /// ヘッド学習の各エポック後の処理
    ///
    /// best_model の保存、早期終了（最良 val_loss の重みに戻す）、学習率減衰の順に判定します。
    fn finish_head_epoch(
        &mut self,
        model: WaterClassifier<B>,
        metrics: &EpochMetrics,
        schedule: &mut HeadSchedule<B>,
    ) -> Result<HeadStep<B>> {
        self.maybe_checkpoint(&model, metrics)?;

        if schedule
            .early
            .update(metrics.epoch, metrics.val_loss, || (model.clone(), metrics.clone()))
        {
            return Ok(match schedule.early.take_best() {
                Some((best_epoch, (best_model, best_metrics))) => {
                    info!(
                        "早期終了: {} エポック改善なし。エポック {} の重みに戻します (val_loss {:.4})",
                        self.config.training.early_stopping_patience, best_epoch, best_metrics.val_loss
                    );
                    HeadStep::Stop {
                        model: best_model,
                        metrics: best_metrics,
                    }
                }
                None => HeadStep::Stop {
                    model,
                    metrics: metrics.clone(),
                },
            });
        }

        if let Some(reduced) = schedule.plateau.update(metrics.val_loss, schedule.learning_rate) {
            info!("学習率を下げます: {:.2e} → {:.2e}", schedule.learning_rate, reduced);
            schedule.learning_rate = reduced;
        }
        Ok(HeadStep::Continue(model))
    }

    fn fine_tune<F>(
        &mut self,
        mut model: WaterClassifier<B>,
        epoch_offset: usize,
        train_loader: &mut SplitLoader,
        val_loader: &mut SplitLoader,
        progress_callback: &mut F,
    ) -> Result<PhaseResult<B>>
    where
        F: FnMut(&EpochMetrics),
    {
        let config = self.config;
        let settings = &config.training.fine_tune;
        let learning_rate = settings.learning_rate;
        // 新しいオプティマイザで開始
        let mut optimizer = AdamConfig::new().init::<B, WaterClassifier<B>>();
        info!(
            "ファインチューニング: {} エポック, 学習率 {:.2e}",
            settings.epochs, learning_rate
        );

        let mut last = None;
        for step in 1..=settings.epochs {
            let epoch = epoch_offset + step;
            let (trained, train_stats) =
                self.train_epoch(model, &mut optimizer, train_loader, learning_rate, false, epoch)?;
            model = trained;
            let val_stats = validate_model(&model.valid(), val_loader, &self.device)?;

            let metrics = self.record_epoch(
                epoch,
                TrainingPhase::FineTuning,
                train_stats,
                val_stats,
                learning_rate,
                progress_callback,
            );
            self.maybe_checkpoint(&model, &metrics)?;
            last = Some(metrics);
        }

        let last = last.ok_or_else(|| ClassifierError::Training {
            epoch: epoch_offset,
            reason: "no fine-tuning epoch was run".to_string(),
        })?;

        Ok(PhaseResult {
            model,
            epochs_run: settings.epochs,
            learning_rate,
            last,
            early_stopped: false,
        })
    }

    /// 1エポック学習
    fn train_epoch<O>(
        &self,
        mut model: WaterClassifier<B>,
        optimizer: &mut O,
        loader: &mut SplitLoader,
        learning_rate: f64,
        freeze_backbone: bool,
        epoch: usize,
    ) -> Result<(WaterClassifier<B>, EpochStats)>
    where
        O: Optimizer<WaterClassifier<B>, B>,
    {
        let mut acc = MetricAccumulator::default();

        for (index, batch) in loader.batches().enumerate() {
            let batch = batch?;
            let (images, targets) = batch.to_tensors::<B>(&self.device);

            let logits = model.forward_train(images, freeze_backbone);
            let loss = binary_cross_entropy_with_logits(logits.clone(), targets);
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(ClassifierError::Training {
                    epoch,
                    reason: format!("non-finite loss ({}) at batch {}", loss_value, index + 1),
                });
            }

            let probabilities = probabilities_to_vec(sigmoid(logits.inner()))?;
            let correct = count_correct(&probabilities, &batch.labels);
            acc.add(loss_value, batch.len(), correct);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(learning_rate, model, grads);

            debug!(
                "エポック {} バッチ {}: loss {:.4}, 正解 {}/{}",
                epoch,
                index + 1,
                loss_value,
                correct,
                batch.len()
            );
        }

        Ok((model, acc.finish()))
    }

    fn record_epoch<F>(
        &mut self,
        epoch: usize,
        phase: TrainingPhase,
        train: EpochStats,
        val: EpochStats,
        learning_rate: f64,
        progress_callback: &mut F,
    ) -> EpochMetrics
    where
        F: FnMut(&EpochMetrics),
    {
        let metrics = EpochMetrics {
            epoch,
            phase,
            loss: train.loss,
            accuracy: train.accuracy,
            val_loss: val.loss,
            val_accuracy: val.accuracy,
            learning_rate,
        };

        info!(
            "[{}] エポック {}: loss {:.4}, acc {:.4}, val_loss {:.4}, val_acc {:.4}, lr {:.2e}",
            phase, epoch, train.loss, train.accuracy, val.loss, val.accuracy, learning_rate
        );

        self.history.record(metrics.clone());
        progress_callback(&metrics);
        metrics
    }

    /// val_accuracy が最高を更新したら best_model を上書き
    fn maybe_checkpoint(&mut self, model: &WaterClassifier<B>, metrics: &EpochMetrics) -> Result<()> {
        let previous = self.checkpoint.best_accuracy();
        if !self.checkpoint.update(metrics.epoch, metrics.val_accuracy) {
            return Ok(());
        }

        let path = self.config.best_model_path();
        self.save_artifact(model, &path, metrics)?;
        match previous {
            Some(prev) => info!(
                "val_accuracy が改善しました ({:.4} → {:.4})。保存: {}",
                prev,
                metrics.val_accuracy,
                path.display()
            ),
            None => info!("最初のモデルを保存: {}", path.display()),
        }
        Ok(())
    }

    fn save_artifact(&self, model: &WaterClassifier<B>, path: &Path, metrics: &EpochMetrics) -> Result<PathBuf> {
        let metadata = ModelMetadata::new(
            self.class_names.clone(),
            &self.model_config,
            metrics.phase,
            metrics.epoch,
            metrics.val_accuracy,
            metrics.val_loss,
        );
        let bytes = model.valid().to_bytes()?;
        save_model_with_metadata(path, &metadata, &bytes)
    }
}

/// ヘッド学習でバックボーンを凍結するか
///
/// 事前学習済みの重みが無いバックボーンは凍結しない。
fn freeze_for_head(freeze_backbone: bool, has_pretrained_weights: bool) -> bool {
    freeze_backbone && has_pretrained_weights
}

/// ヘッド学習の早期終了と学習率減衰
struct HeadSchedule<B: AutodiffBackend> {
    early: EarlyStopping<(WaterClassifier<B>, EpochMetrics)>,
    plateau: ReduceLrOnPlateau,
    learning_rate: f64,
}

impl<B: AutodiffBackend> HeadSchedule<B> {
    fn new(training: &TrainingSettings) -> Self {
        Self {
            early: EarlyStopping::new(training.early_stopping_patience),
            plateau: ReduceLrOnPlateau::new(
                training.lr_decay_patience,
                training.lr_decay_factor,
                training.min_learning_rate,
            ),
            learning_rate: training.learning_rate,
        }
    }
}

enum HeadStep<B: AutodiffBackend> {
    Continue(WaterClassifier<B>),
    /// 早期終了。戻した重みとそのエポックの指標
    Stop {
        model: WaterClassifier<B>,
        metrics: EpochMetrics,
    },
}

/// フェーズの結果
struct PhaseResult<B: AutodiffBackend> {
    model: WaterClassifier<B>,
    epochs_run: usize,
    learning_rate: f64,
    /// 最終モデルに対応するエポックの指標
    last: EpochMetrics,
    early_stopped: bool,
}

/// 設定ファイルに従って学習を実行
pub fn train_model<B, F>(config: &AppConfig, device: B::Device, progress_callback: F) -> Result<TrainingOutcome>
where
    B: AutodiffBackend,
    F: FnMut(&EpochMetrics),
{
    config.log_summary();
    Trainer::<B>::new(config, device).run(progress_callback)
}
