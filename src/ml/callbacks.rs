//! エポック終了時の判定
//!
//! - 最良モデルの保存判定（val_accuracy が真に上回った時のみ）
//! - 早期終了（val_loss が patience エポック改善しない）
//! - 学習率の減衰（val_loss が停滞したら係数を掛ける）
//!
//! どれも指標の列だけを見る純粋な状態機械で、モデルやファイルには触れません。

/// 最良 val_accuracy の追跡
#[derive(Debug, Clone, Default)]
pub struct BestCheckpoint {
    best: Option<(usize, f64)>,
}

impl BestCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存すべきなら true（同値では上書きしない）
    pub fn update(&mut self, epoch: usize, val_accuracy: f64) -> bool {
        let improved = match self.best {
            None => true,
            Some((_, best)) => val_accuracy > best,
        };
        if improved {
            self.best = Some((epoch, val_accuracy));
        }
        improved
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.map(|(epoch, _)| epoch)
    }

    pub fn best_accuracy(&self) -> Option<f64> {
        self.best.map(|(_, accuracy)| accuracy)
    }
}

/// val_loss 基準の早期終了
///
/// 最良エポックのスナップショット `S`（通常はモデル）を保持し、終了時に戻せるようにします。
#[derive(Debug, Clone)]
pub struct EarlyStopping<S> {
    patience: usize,
    best_loss: f64,
    best_epoch: usize,
    best_snapshot: Option<S>,
    wait: usize,
    stopped: bool,
}

impl<S> EarlyStopping<S> {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best_epoch: 0,
            best_snapshot: None,
            wait: 0,
            stopped: false,
        }
    }

    /// エポック結果を反映し、終了すべきなら true
    ///
    /// `snapshot` は改善した時のみ呼ばれます。
    pub fn update(&mut self, epoch: usize, val_loss: f64, snapshot: impl FnOnce() -> S) -> bool {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = epoch;
            self.best_snapshot = Some(snapshot());
            self.wait = 0;
        } else {
            self.wait += 1;
            if self.wait >= self.patience {
                self.stopped = true;
            }
        }
        self.stopped
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    /// 最良エポックのスナップショットを取り出す
    pub fn take_best(&mut self) -> Option<(usize, S)> {
        self.best_snapshot.take().map(|s| (self.best_epoch, s))
    }
}

/// val_loss 停滞時の学習率減衰
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    patience: usize,
    factor: f64,
    min_lr: f64,
    best_loss: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(patience: usize, factor: f64, min_lr: f64) -> Self {
        Self {
            patience,
            factor,
            min_lr,
            best_loss: f64::INFINITY,
            wait: 0,
        }
    }

    /// 学習率を更新。下げた場合は新しい値を返す
    pub fn update(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }

        self.wait = 0;
        if current_lr <= self.min_lr {
            return None;
        }
        Some((current_lr * self.factor).max(self.min_lr))
    }
}
