//! エンジンの設定

use serde::Deserialize;
use std::time::Duration;
use tomare_target::Platform;

/// メモリ監視の実装方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchBackend {
    /// ページ保護を外し、アクセス違反の例外で検出する
    PageProtection,
    /// アクセスモニタの通知で検出する
    AccessMonitor,
}

impl WatchBackend {
    /// プラットフォームの既定の方式
    pub fn default_for(platform: Platform) -> Self {
        match platform {
            Platform::Windows => WatchBackend::AccessMonitor,
            _ => WatchBackend::PageProtection,
        }
    }
}

/// ステップ実行のブートストラップ定数
///
/// 動的再コンパイルのプリミティブが実ターゲットコードに到達する前に実行する
/// 自身のコードを読み飛ばすための値です。経験的に決められたもので、
/// トレーサの実装を変える場合は再確認が必要です。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    /// 無視するリターン命令の数（これを超えたらコールアウトを開始する）
    pub bootstrap_returns: u32,
    /// ブロックを丸ごとコピーするアーキテクチャで、追加で待つブロック数の閾値
    pub split_block_extra_blocks: u32,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            bootstrap_returns: 4,
            split_block_extra_blocks: 2,
        }
    }
}

/// エンジンの設定
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// コントローラが1つのコマンドの結果を待つ時間（ミリ秒）
    pub command_timeout_ms: u64,
    /// 停止中のスレッドがコマンドを確認する間隔の上限（ミリ秒）
    pub poll_interval_ms: u64,
    pub step: StepConfig,
    /// 未指定ならプラットフォームの既定
    pub watch_backend: Option<WatchBackend>,
    /// エントリポイントで停止する
    pub break_at_entry: bool,
    pub debug: bool,
    /// エンジンがプロセスを起動した（アタッチではない）
    pub spawned: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3000,
            poll_interval_ms: 200,
            step: StepConfig::default(),
            watch_backend: None,
            break_at_entry: false,
            debug: false,
            spawned: false,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watch_backend_for(&self, platform: Platform) -> WatchBackend {
        self.watch_backend
            .unwrap_or_else(|| WatchBackend::default_for(platform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(3));
        assert_eq!(config.poll_interval(), Duration::from_millis(200));
        assert_eq!(config.step.bootstrap_returns, 4);
        assert_eq!(config.watch_backend_for(Platform::Linux), WatchBackend::PageProtection);
        assert_eq!(config.watch_backend_for(Platform::Windows), WatchBackend::AccessMonitor);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"command_timeout_ms": 500, "step": {"bootstrap_returns": 2}, "watch_backend": "access_monitor"}"#,
        )
        .unwrap();
        assert_eq!(config.command_timeout_ms, 500);
        assert_eq!(config.poll_interval_ms, 200);
        assert_eq!(config.step.bootstrap_returns, 2);
        assert_eq!(config.step.split_block_extra_blocks, 2);
        assert_eq!(config.watch_backend, Some(WatchBackend::AccessMonitor));
    }
}
