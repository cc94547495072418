//! サービスマネージャ
//!
//! フェイルオーバー選択・パイプライン・ヘルスモニタを組み合わせ、
//! `transcribe` / `synthesize` / `get_status` を提供する。
//! 呼び出し元へは常に構造化された結果を返し、エラーやパニックを外へ出さない。

use crate::config::Config;
use crate::failover::FailoverPolicy;
use crate::health::{HealthMonitor, MonitorHandle};
use crate::pipeline::{PipelineConfig, TranscriptionPipeline};
use crate::provider::{call_guarded, SynthesisOptions, VoiceProvider};
use crate::state::{SharedState, StatusSnapshot};
use crate::types::{ErrorKind, ProviderFailure, SynthesisResult, TranscriptionResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// 合成時のテキスト前処理（空なら "..."）
fn prepare_text(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "..."
    } else {
        trimmed
    }
}

/// 期限切れで試せなかった候補を失敗として記録
fn skipped_by_deadline(providers: &[Arc<dyn VoiceProvider>]) -> Vec<ProviderFailure> {
    providers
        .iter()
        .map(|p| ProviderFailure {
            provider_id: p.id().to_string(),
            error_kind: ErrorKind::Timeout,
            error_message: "リクエストの期限切れのため未試行".to_string(),
        })
        .collect()
}

/// 音声合成の設定
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub default_voice: String,
    pub call_timeout: Duration,
}

/// サービスマネージャ
///
/// 明示的に生成して所有し、`start()` / `stop()` でヘルスモニタの寿命を管理する。
pub struct ServiceManager {
    state: SharedState,
    monitor: Arc<HealthMonitor>,
    pipeline: TranscriptionPipeline,
    synthesis: SynthesisSettings,
    request_deadline: Duration,
    handle: Mutex<Option<MonitorHandle>>,
}

impl ServiceManager {
    pub fn new(
        policy: FailoverPolicy,
        pipeline: PipelineConfig,
        synthesis: SynthesisSettings,
        health_check_timeout: Duration,
        request_deadline: Duration,
    ) -> Self {
        let interval = Duration::from_secs(policy.health_check_interval_seconds);
        let state = SharedState::new(policy);
        let monitor = Arc::new(HealthMonitor::new(
            state.clone(),
            interval,
            health_check_timeout,
        ));

        Self {
            state,
            monitor,
            pipeline: TranscriptionPipeline::new(pipeline),
            synthesis,
            request_deadline,
            handle: Mutex::new(None),
        }
    }

    /// 設定から作成（プロバイダは別途登録する）
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.failover.to_policy(),
            PipelineConfig::new(&config.stt, &config.quality),
            SynthesisSettings {
                default_voice: config.tts.default_voice.clone(),
                call_timeout: Duration::from_secs(config.tts.timeout_seconds),
            },
            config.failover.health_check_timeout(),
            Duration::from_secs(config.stt.request_deadline_seconds),
        )
    }

    /// プロバイダを登録
    pub fn register_provider(&self, provider: Arc<dyn VoiceProvider>) {
        let id = provider.id().to_string();
        let caps = provider.capabilities();
        if self.state.register(provider) {
            log::info!("{}: プロバイダを再登録しました", id);
        } else {
            log::info!(
                "{}: プロバイダを登録しました (認識: {}, 合成: {}, 死活確認: {})",
                id,
                caps.recognition,
                caps.synthesis,
                caps.health_check
            );
        }
    }

    /// プロバイダを登録解除
    pub fn unregister_provider(&self, id: &str) -> bool {
        let removed = self.state.unregister(id);
        if removed {
            log::info!("{}: プロバイダを登録解除しました", id);
        } else {
            log::warn!("{}: 登録されていないプロバイダです", id);
        }
        removed
    }

    /// 初回ヘルスチェックを行い、ヘルスモニタを開始
    ///
    /// 既に開始済みなら何もしない。間隔が0なら定期チェックは行わない。
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            log::debug!("ヘルスモニタは既に開始されています");
            return;
        }

        self.monitor.check_all().await;

        if self.monitor.interval().is_zero() {
            log::info!("ヘルスチェック間隔が0のため定期チェックは行いません");
            return;
        }
        *handle = Some(Arc::clone(&self.monitor).spawn());
    }

    /// ヘルスモニタを停止して終了を待つ
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
            log::info!("ヘルスモニタを停止しました");
        }
    }

    /// ヘルスモニタが動作中か
    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// 今すぐヘルスチェックを行う（1間隔以内に問い合わせたプロバイダは省略）
    pub async fn check_health(&self) {
        self.monitor.check_all().await;
    }

    /// 現在の状態
    pub fn get_status(&self) -> StatusSnapshot {
        self.state.snapshot()
    }

    pub fn active_provider(&self) -> String {
        self.state.active()
    }

    /// 音声認識
    ///
    /// 候補プロバイダを順に試し、最初の成功を返す。全て失敗した場合は
    /// `AllServicesFailed` とプロバイダ別の失敗一覧を返す。
    pub async fn transcribe(&self, audio: &[u8], language: &str) -> TranscriptionResult {
        let started = Instant::now();
        let deadline = started + self.request_deadline;

        let candidates = self.state.candidates(|c| c.recognition);
        if candidates.is_empty() {
            log::error!("音声認識に使えるプロバイダがありません");
            return TranscriptionResult::failure(
                self.state.active(),
                ErrorKind::ProviderUnavailable,
                "音声認識に対応した利用可能なプロバイダがありません",
            )
            .with_processing_time(started.elapsed().as_secs_f64());
        }

        let mut failures: Vec<ProviderFailure> = Vec::new();
        let mut last: Option<TranscriptionResult> = None;

        for (i, provider) in candidates.iter().enumerate() {
            if Instant::now() >= deadline {
                log::warn!("リクエストの期限切れ、残り {} 件の候補を打ち切り", candidates.len() - i);
                failures.extend(skipped_by_deadline(&candidates[i..]));
                break;
            }

            log::info!("{}: 文字起こしを試行 ({}/{})", provider.id(), i + 1, candidates.len());
            let result = self
                .pipeline
                .run(provider.as_ref(), audio, language, deadline)
                .await;

            if result.success {
                self.state.record_success(provider.id());
                return result
                    .with_failures(failures)
                    .with_processing_time(started.elapsed().as_secs_f64());
            }

            if let Some(failure) = result.to_failure() {
                log::warn!(
                    "{}: 文字起こし失敗 ({:?}): {}",
                    failure.provider_id,
                    failure.error_kind,
                    failure.error_message
                );
                self.state.record_failure(&failure);
                failures.push(failure);
            }
            last = Some(result);
        }

        log::error!("全てのプロバイダで文字起こしに失敗しました ({} 件)", failures.len());
        let Some(last) = last else {
            return TranscriptionResult::failure(
                self.state.active(),
                ErrorKind::AllServicesFailed,
                "期限切れのため音声認識サービスを試行できませんでした",
            )
            .with_failures(failures)
            .with_processing_time(started.elapsed().as_secs_f64());
        };

        let mut aggregate = TranscriptionResult::failure(
            last.provider_id.clone(),
            ErrorKind::AllServicesFailed,
            format!(
                "全ての音声認識サービスが失敗しました (最後のエラー: {}: {})",
                last.provider_id,
                last.error_message.as_deref().unwrap_or_default()
            ),
        )
        .with_attempts(last.attempts);
        if let Some(report) = last.audio_quality {
            aggregate = aggregate.with_audio_quality(report);
        }
        aggregate
            .with_failures(failures)
            .with_processing_time(started.elapsed().as_secs_f64())
    }

    /// 音声合成
    ///
    /// 品質解析・リトライは行わず、失敗したら次の候補へ進む。
    pub async fn synthesize(
        &self,
        text: &str,
        language: &str,
        voice_id: Option<&str>,
    ) -> SynthesisResult {
        let started = Instant::now();
        let deadline = started + self.request_deadline;
        let text = prepare_text(text);
        let voice_id = voice_id
            .filter(|v| !v.is_empty())
            .unwrap_or(&self.synthesis.default_voice)
            .to_string();

        let candidates = self.state.candidates(|c| c.synthesis);
        if candidates.is_empty() {
            log::error!("音声合成に使えるプロバイダがありません");
            return SynthesisResult::failure(
                self.state.active(),
                ErrorKind::ProviderUnavailable,
                "音声合成に対応した利用可能なプロバイダがありません",
            )
            .with_processing_time(started.elapsed().as_secs_f64());
        }

        let mut failures: Vec<ProviderFailure> = Vec::new();
        let mut last_provider = String::new();

        for (i, provider) in candidates.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("リクエストの期限切れ、残り {} 件の候補を打ち切り", candidates.len() - i);
                failures.extend(skipped_by_deadline(&candidates[i..]));
                break;
            }

            let options = SynthesisOptions {
                voice_id: voice_id.clone(),
                timeout: self.synthesis.call_timeout.min(remaining),
            };
            log::info!("{}: 音声合成を試行 (ボイス: {})", provider.id(), voice_id);

            let result = match call_guarded(
                options.timeout,
                provider.synthesize(text, language, &options),
            )
            .await
            {
                Ok(result) => result,
                Err(e) => SynthesisResult::failure(provider.id(), e.kind(), e.to_string()),
            };

            if result.success {
                self.state.record_success(provider.id());
                return result
                    .with_failures(failures)
                    .with_processing_time(started.elapsed().as_secs_f64());
            }

            if let Some(failure) = result.to_failure() {
                log::warn!(
                    "{}: 音声合成失敗 ({:?}): {}",
                    failure.provider_id,
                    failure.error_kind,
                    failure.error_message
                );
                self.state.record_failure(&failure);
                failures.push(failure);
            }
            last_provider = provider.id().to_string();
        }

        log::error!("全てのプロバイダで音声合成に失敗しました ({} 件)", failures.len());
        let last_message = failures
            .last()
            .map(|f| format!("{}: {}", f.provider_id, f.error_message))
            .unwrap_or_default();
        if last_provider.is_empty() {
            last_provider = self.state.active();
        }
        SynthesisResult::failure(
            last_provider,
            ErrorKind::AllServicesFailed,
            format!("全ての音声合成サービスが失敗しました (最後のエラー: {})", last_message),
        )
        .with_failures(failures)
        .with_processing_time(started.elapsed().as_secs_f64())
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            log::debug!("停止されていないヘルスモニタを中断します");
            handle.abort();
        }
    }
}
