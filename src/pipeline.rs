//! 適応型文字起こしパイプライン
//!
//! 1リクエスト・1プロバイダ分の処理を行う:
//!
//! ```text
//! 品質解析 → (問題があれば) 前処理 → 初回試行 → (失敗 or 低信頼度なら) リトライ戦略を順に試行 → 最良結果
//! ```
//!
//! リトライは同じプロバイダに対して逐次実行する（並列にはしない）。

use crate::audio_quality::AudioQualityAnalyzer;
use crate::config::{QualityConfig, SttConfig};
use crate::preprocess::AudioPreprocessor;
use crate::provider::{call_guarded, RecognitionOptions, VoiceProvider};
use crate::types::{AudioFormat, AudioQualityReport, ErrorKind, TranscriptionResult};
use std::borrow::Cow;
use std::time::Duration;
use tokio::time::Instant;

/// リトライ時に変更する認識パラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStrategy {
    /// ログと結果に残す名前
    pub name: &'static str,
    pub model: Option<&'static str>,
    pub sample_rate_hz: Option<u32>,
    pub use_enhanced: Option<bool>,
}

impl RetryStrategy {
    /// 基本パラメータにこの戦略の変更を適用
    pub fn apply(&self, base: &RecognitionOptions) -> RecognitionOptions {
        let mut options = base.clone();
        if let Some(model) = self.model {
            options.model = model.to_string();
        }
        if let Some(rate) = self.sample_rate_hz {
            options.sample_rate_hz = rate;
        }
        if let Some(enhanced) = self.use_enhanced {
            options.use_enhanced = enhanced;
        }
        options
    }
}

/// 既定のリトライ戦略（この順に試す）
pub fn default_strategies() -> Vec<RetryStrategy> {
    vec![
        RetryStrategy {
            name: "phone_call_model",
            model: Some("phone_call"),
            sample_rate_hz: None,
            use_enhanced: None,
        },
        RetryStrategy {
            name: "sample_rate_8000",
            model: None,
            sample_rate_hz: Some(8000),
            use_enhanced: None,
        },
        RetryStrategy {
            name: "no_enhancement",
            model: None,
            sample_rate_hz: None,
            use_enhanced: Some(false),
        },
    ]
}

/// パイプライン設定
///
/// `SttConfig` と `QualityConfig` から生成し、以後は変更しない。
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub enhance_audio: bool,
    pub max_retries: u32,
    /// これ未満の信頼度ならリトライする
    pub confidence_threshold: f32,
    /// 1回のプロバイダ呼び出しのタイムアウト
    pub call_timeout: Duration,
    pub quality: QualityConfig,
    pub strategies: Vec<RetryStrategy>,
}

impl PipelineConfig {
    pub fn new(stt: &SttConfig, quality: &QualityConfig) -> Self {
        Self {
            enhance_audio: stt.enhance_audio,
            max_retries: stt.max_retries,
            confidence_threshold: stt.confidence_threshold,
            call_timeout: Duration::from_secs(stt.timeout_seconds),
            quality: quality.clone(),
            strategies: default_strategies(),
        }
    }

    /// 実際に行うリトライ回数の上限
    pub fn retry_limit(&self) -> usize {
        (self.max_retries as usize).min(self.strategies.len())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(&SttConfig::default(), &QualityConfig::default())
    }
}

/// 新しい結果が現在の最良結果より良いか
///
/// 信頼度が厳密に上回る場合のみ置き換える（同値なら現状維持）。
fn is_better(candidate: &TranscriptionResult, best: &TranscriptionResult) -> bool {
    if !candidate.success {
        return false;
    }
    if !best.success {
        return true;
    }
    match (candidate.confidence, best.confidence) {
        (Some(new), Some(old)) => new > old,
        (Some(_), None) => true,
        _ => false,
    }
}

/// 適応型文字起こしパイプライン
pub struct TranscriptionPipeline {
    config: PipelineConfig,
    analyzer: AudioQualityAnalyzer,
    preprocessor: AudioPreprocessor,
}

impl TranscriptionPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let analyzer = AudioQualityAnalyzer::new(&config.quality);
        let preprocessor = AudioPreprocessor::new(config.quality.high_pass_cutoff_hz);
        Self {
            config,
            analyzer,
            preprocessor,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// リトライが必要か（失敗、または信頼度が閾値未満）
    fn needs_retry(&self, result: &TranscriptionResult) -> bool {
        !result.success
            || result
                .confidence
                .is_some_and(|c| c < self.config.confidence_threshold)
    }

    /// 問題がある場合のみ前処理する。失敗時は元の音声を使う
    fn prepare<'a>(&self, audio: &'a [u8], report: &AudioQualityReport) -> Cow<'a, [u8]> {
        if !self.config.enhance_audio {
            log::debug!("音声補正は無効");
            return Cow::Borrowed(audio);
        }
        if !report.has_issues() {
            log::debug!("音声品質に問題なし、前処理をスキップ");
            return Cow::Borrowed(audio);
        }

        log::info!("音声品質の問題を検出: {:?}", report.issues);
        match self.preprocessor.process(audio, report) {
            Ok(processed) => {
                log::info!("前処理を適用 ({} → {} バイト)", audio.len(), processed.len());
                Cow::Owned(processed)
            }
            Err(e) => {
                log::warn!("前処理に失敗、元の音声を使用: {:#}", e);
                Cow::Borrowed(audio)
            }
        }
    }

    /// 1回の呼び出し。エラー・タイムアウト・パニックは失敗結果に変換する
    async fn attempt(
        &self,
        provider: &dyn VoiceProvider,
        audio: &[u8],
        language: &str,
        options: &RecognitionOptions,
        deadline: Instant,
    ) -> TranscriptionResult {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return TranscriptionResult::failure(
                provider.id(),
                ErrorKind::Timeout,
                "リクエストの期限切れ",
            );
        }

        let timeout = options.timeout.min(remaining);
        let mut options = options.clone();
        options.timeout = timeout;

        match call_guarded(timeout, provider.transcribe(audio, language, &options)).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("{}: 文字起こし失敗: {}", provider.id(), e);
                TranscriptionResult::failure(provider.id(), e.kind(), e.to_string())
            }
        }
    }

    /// パイプラインを実行
    ///
    /// 常に結果を返す。成功結果が1つもなければ最後の失敗結果を返す。
    pub async fn run(
        &self,
        provider: &dyn VoiceProvider,
        audio: &[u8],
        language: &str,
        deadline: Instant,
    ) -> TranscriptionResult {
        let started = Instant::now();

        let report = self.analyzer.analyze(audio);
        let prepared = self.prepare(audio, &report);

        // 前処理済みなら標準フォーマット、そのままなら元のサンプルレートを伝える
        let sample_rate_hz = match &prepared {
            Cow::Borrowed(_) if report.frame_rate_hz > 0 => report.frame_rate_hz,
            _ => AudioFormat::CANONICAL.sample_rate,
        };
        let base = RecognitionOptions {
            timeout: self.config.call_timeout,
            sample_rate_hz,
            ..RecognitionOptions::default()
        };

        let mut attempts = 1u32;
        let mut best = self
            .attempt(provider, &prepared, language, &base, deadline)
            .await;
        let mut best_strategy: Option<&'static str> = None;

        if self.needs_retry(&best) {
            if best.success {
                log::warn!(
                    "{}: 信頼度が低い ({:?})、リトライします",
                    provider.id(),
                    best.confidence
                );
            } else {
                log::info!(
                    "{}: 初回試行が失敗 ({:?})、リトライします",
                    provider.id(),
                    best.error_kind
                );
            }

            let limit = self.config.retry_limit();
            for (i, strategy) in self.config.strategies.iter().take(limit).enumerate() {
                if Instant::now() >= deadline {
                    log::warn!("{}: 期限切れのためリトライを中断", provider.id());
                    break;
                }

                log::info!(
                    "{}: リトライ {}/{} (戦略: {})",
                    provider.id(),
                    i + 1,
                    limit,
                    strategy.name
                );
                let options = strategy.apply(&base);
                attempts += 1;
                let result = self
                    .attempt(provider, &prepared, language, &options, deadline)
                    .await;

                if is_better(&result, &best) {
                    log::info!(
                        "{}: より良い結果 (信頼度: {:?}, 戦略: {})",
                        provider.id(),
                        result.confidence,
                        strategy.name
                    );
                    best = result;
                    best_strategy = Some(strategy.name);
                } else if !best.success && !result.success {
                    best = result;
                }
            }
        }

        let mut best = best
            .with_audio_quality(report)
            .with_processing_time(started.elapsed().as_secs_f64())
            .with_attempts(attempts);
        if let Some(name) = best_strategy {
            best = best.with_strategy(name);
        }
        best
    }
}
