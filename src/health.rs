//! ヘルスモニタ
//!
//! 一定間隔で全プロバイダの `test_connection` を呼び、状態表へ書き込む。
//! 定期チェックは毎回問い合わせる。起動時や手動の更新要求は、前回の問い合わせから
//! 1間隔以内のプロバイダを省略し、同時に来た要求も直列化する。

use crate::provider::{call_guarded, ProviderError};
use crate::state::{HealthRecord, ProviderEntry, SharedState};
use crate::types::ProviderStatus;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
struct CachedProbe {
    generation: u64,
    probed_at: Instant,
}

/// ヘルスモニタ
pub struct HealthMonitor {
    state: SharedState,
    interval: Duration,
    probe_timeout: Duration,
    /// プロバイダごとの最終問い合わせ（ロック自体が問い合わせの直列化ゲート）
    cache: Mutex<HashMap<String, CachedProbe>>,
}

impl HealthMonitor {
    pub fn new(state: SharedState, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            state,
            interval,
            probe_timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 1プロバイダの死活確認
    async fn probe(&self, entry: &ProviderEntry) -> ProviderStatus {
        let id = &entry.descriptor.id;
        match call_guarded(self.probe_timeout, entry.provider.test_connection()).await {
            Ok(true) => {
                log::debug!("{}: ヘルスチェック OK", id);
                ProviderStatus::Available
            }
            Ok(false) => {
                log::warn!("{}: ヘルスチェック失敗（利用不可）", id);
                ProviderStatus::Unavailable
            }
            Err(ProviderError::Timeout(e)) => {
                log::warn!("{}: ヘルスチェックがタイムアウト: {}", id, e);
                ProviderStatus::Unavailable
            }
            Err(e) => {
                log::error!("{}: ヘルスチェック中にエラー: {}", id, e);
                ProviderStatus::Error
            }
        }
    }

    /// 全プロバイダを確認して状態表を更新（起動時・手動更新用）
    ///
    /// 死活確認を持たないプロバイダは問い合わせずに Available とする。
    /// 1間隔以内の問い合わせ結果があるプロバイダは問い合わせず、状態も書き換えない。
    pub async fn check_all(&self) {
        self.refresh(false).await;
    }

    /// キャッシュを使わずに全プロバイダを問い合わせる（定期チェック用）
    pub async fn poll_all(&self) {
        self.refresh(true).await;
    }

    async fn refresh(&self, bypass_cache: bool) {
        let mut cache = self.cache.lock().await;
        let entries = self.state.entries();
        cache.retain(|id, _| entries.iter().any(|e| &e.descriptor.id == id));

        let mut records = Vec::with_capacity(entries.len());
        let mut skipped = 0;
        for entry in &entries {
            let id = &entry.descriptor.id;

            if !entry.descriptor.capabilities.health_check {
                records.push(HealthRecord {
                    provider_id: id.clone(),
                    generation: entry.generation,
                    status: ProviderStatus::Available,
                    checked_at: Utc::now(),
                });
                continue;
            }

            let fresh = !bypass_cache
                && cache.get(id).is_some_and(|c| {
                    c.generation == entry.generation && c.probed_at.elapsed() < self.interval
                });
            if fresh {
                // 古い結果で、その後に記録された失敗を上書きしない
                log::debug!("{}: 前回のヘルスチェックから1間隔経っていないため省略", id);
                skipped += 1;
                continue;
            }

            // 問い合わせ開始時刻を基準にする
            let probed_at = Instant::now();
            let status = self.probe(entry).await;
            let checked_at = Utc::now();
            cache.insert(
                id.clone(),
                CachedProbe {
                    generation: entry.generation,
                    probed_at,
                },
            );

            records.push(HealthRecord {
                provider_id: id.clone(),
                generation: entry.generation,
                status,
                checked_at,
            });
        }

        self.state.apply_health(&records, Utc::now());
        log::info!(
            "ヘルスチェック完了 ({} プロバイダ, 省略 {}, アクティブ: {})",
            records.len(),
            skipped,
            self.state.active()
        );
    }

    /// バックグラウンドで定期チェックを開始
    ///
    /// 最初のチェックは1間隔後（起動時のチェックは呼び出し側で行う）。
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval_secs = self.interval.as_secs();
        let monitor = self;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 1回目の tick は即座に完了する
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.poll_all().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("ヘルスモニタを終了しました");
        });

        log::info!("ヘルスモニタを開始しました (間隔: {}秒)", interval_secs);

        MonitorHandle { shutdown_tx, task }
    }
}

/// 実行中のヘルスモニタタスク
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// 停止を通知して終了を待つ
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                log::error!("ヘルスモニタタスクが異常終了: {}", e);
            }
        }
    }

    /// 待たずに中断する（Drop 用）
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::{FailoverPolicy, FailoverStrategy};
    use crate::provider::mock::MockProvider;
    use crate::types::Capabilities;

    const INTERVAL: Duration = Duration::from_secs(300);

    fn shared_state(auto_restore: bool) -> SharedState {
        SharedState::new(FailoverPolicy {
            strategy: FailoverStrategy::Availability,
            primary_provider_id: "google".to_string(),
            failover_provider_ids: vec!["whisper".to_string()],
            auto_restore_primary: auto_restore,
            health_check_interval_seconds: INTERVAL.as_secs(),
        })
    }

    fn monitor(state: &SharedState) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            state.clone(),
            INTERVAL,
            Duration::from_secs(5),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_results_are_written() {
        let state = shared_state(true);
        let google = Arc::new(MockProvider::recognizer("google"));
        let whisper = Arc::new(MockProvider::recognizer("whisper"));
        let broken = Arc::new(MockProvider::recognizer("broken"));
        google.set_health(Ok(false));
        broken.set_health(Err(ProviderError::Other("接続拒否".to_string())));
        state.register(google.clone());
        state.register(whisper.clone());
        state.register(broken.clone());

        monitor(&state).check_all().await;

        assert_eq!(state.status_of("google"), Some(ProviderStatus::Unavailable));
        assert_eq!(state.status_of("whisper"), Some(ProviderStatus::Available));
        assert_eq!(state.status_of("broken"), Some(ProviderStatus::Error));
        assert_eq!(state.active(), "whisper");

        let snapshot = state.snapshot();
        assert!(snapshot.last_health_check.is_some());
        assert!(snapshot.provider("google").unwrap().descriptor.last_checked_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_without_health_check_is_never_polled() {
        let state = shared_state(true);
        let local = Arc::new(MockProvider::with_capabilities(
            "local",
            Capabilities::recognition().without_health_check(),
        ));
        local.set_health(Ok(false));
        state.register(local.clone());

        let monitor = monitor(&state);
        monitor.check_all().await;
        tokio::time::sleep(INTERVAL * 2).await;
        monitor.check_all().await;

        assert_eq!(local.health_checks(), 0);
        assert_eq!(state.status_of("local"), Some(ProviderStatus::Available));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_bounds_probe_frequency() {
        let state = shared_state(true);
        let google = Arc::new(MockProvider::recognizer("google"));
        state.register(google.clone());

        let monitor = monitor(&state);
        tokio::join!(monitor.check_all(), monitor.check_all(), monitor.check_all());
        assert_eq!(google.health_checks(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        monitor.check_all().await;
        assert_eq!(google.health_checks(), 1);

        tokio::time::sleep(INTERVAL).await;
        monitor.check_all().await;
        assert_eq!(google.health_checks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_invalidates_cache() {
        let state = shared_state(true);
        state.register(Arc::new(MockProvider::recognizer("google")));
        let monitor = monitor(&state);
        monitor.check_all().await;

        let replacement = Arc::new(MockProvider::recognizer("google"));
        replacement.set_health(Ok(false));
        state.register(replacement.clone());
        monitor.check_all().await;

        assert_eq!(replacement.health_checks(), 1);
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_is_unavailable() {
        struct Hanging;

        #[async_trait::async_trait]
        impl crate::provider::VoiceProvider for Hanging {
            fn id(&self) -> &str {
                "google"
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities::recognition()
            }
            async fn test_connection(&self) -> Result<bool, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
        }

        let state = shared_state(true);
        state.register(Arc::new(Hanging));
        monitor(&state).check_all().await;

        assert_eq!(state.status_of("google"), Some(ProviderStatus::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_polls_each_interval_and_restores_primary() {
        let state = shared_state(true);
        let google = Arc::new(MockProvider::recognizer("google"));
        let whisper = Arc::new(MockProvider::recognizer("whisper"));
        state.register(google.clone());
        state.register(whisper.clone());

        let monitor = monitor(&state);
        monitor.check_all().await;
        assert_eq!(state.active(), "google");

        state.record_failure(&crate::types::ProviderFailure {
            provider_id: "google".to_string(),
            error_kind: crate::types::ErrorKind::ApiError,
            error_message: "503".to_string(),
        });
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Degraded));
        assert_eq!(state.active(), "whisper");

        let handle = monitor.clone().spawn();
        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(google.health_checks(), 2);
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Available));
        assert_eq!(state.active(), "google");

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(google.health_checks(), 3);

        handle.stop().await;
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(google.health_checks(), 3);
    }

    fn api_failure(id: &str) -> crate::types::ProviderFailure {
        crate::types::ProviderFailure {
            provider_id: id.to_string(),
            error_kind: crate::types::ErrorKind::ApiError,
            error_message: "503".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_polls_slow_provider_every_tick() {
        let state = shared_state(true);
        let google = Arc::new(MockProvider::recognizer("google"));
        google.set_health_delay(Duration::from_millis(200));
        state.register(google.clone());
        state.register(Arc::new(MockProvider::recognizer("whisper")));

        let monitor = monitor(&state);
        let handle = monitor.clone().spawn();

        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(google.health_checks(), 1);
        assert_eq!(state.active(), "google");

        state.record_failure(&api_failure("google"));
        assert_eq!(state.active(), "whisper");

        tokio::time::sleep(INTERVAL).await;
        assert_eq!(google.health_checks(), 2);

        google.set_health(Ok(false));
        tokio::time::sleep(INTERVAL).await;
        assert_eq!(google.health_checks(), 3);
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Unavailable));
        assert_eq!(state.active(), "whisper");

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_check_keeps_recorded_failure() {
        let state = shared_state(true);
        let google = Arc::new(MockProvider::recognizer("google"));
        state.register(google.clone());
        state.register(Arc::new(MockProvider::recognizer("whisper")));

        let monitor = monitor(&state);
        monitor.check_all().await;
        assert_eq!(state.active(), "google");

        state.record_failure(&api_failure("google"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        monitor.check_all().await;

        assert_eq!(google.health_checks(), 1);
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Degraded));
        assert_eq!(state.active(), "whisper");

        monitor.poll_all().await;
        assert_eq!(google.health_checks(), 2);
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Available));
        assert_eq!(state.active(), "google");
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_auto_restore_stays_on_failover() {
        let state = shared_state(false);
        let google = Arc::new(MockProvider::recognizer("google"));
        state.register(google.clone());
        state.register(Arc::new(MockProvider::recognizer("whisper")));

        google.set_health(Ok(false));
        let monitor = monitor(&state);
        monitor.check_all().await;
        assert_eq!(state.active(), "whisper");

        google.set_health(Ok(true));
        tokio::time::sleep(INTERVAL).await;
        monitor.check_all().await;
        assert_eq!(state.status_of("google"), Some(ProviderStatus::Available));
        assert_eq!(state.active(), "whisper");
    }
}
