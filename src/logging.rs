//! ログ出力の初期化
//!
//! `tracing` のコンパクトな整形出力を使用します。

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// グローバルなサブスクライバを登録する
///
/// `verbose` が真なら DEBUG レベルまで出力します。
/// 二重初期化（テストなど）の場合はエラーを返すだけで処理は継続できます。
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(verbose)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("ログの初期化に失敗しました: {}", e))?;

    Ok(())
}
