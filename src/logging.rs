//! ログ初期化
//!
//! ライブラリ側は `tracing` のマクロのみを使い、購読者の設定はバイナリ側で行います。

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ログ設定
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 表示する最小レベル
    pub level: Level,
    /// モジュールパスを表示するか
    pub include_target: bool,
    /// ANSIカラーを使うか
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            include_target: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// デバッグ用（バッチ単位のログも出す）
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_target: true,
            ..Self::default()
        }
    }
}

/// グローバルな購読者を設定する
///
/// 二重に初期化した場合はエラー文字列を返します。
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))
}
