use crate::aws_transcribe::AwsTranscribeBackend;
use crate::config::{ProviderConfig, ProviderKind};
use crate::google_speech::GoogleSpeechBackend;
use crate::openai_tts::OpenAiTtsBackend;
use crate::types::{Capabilities, ErrorKind, SynthesisResult, TranscriptionResult};
use crate::whisper_api::WhisperBackend;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// プロバイダ呼び出しのエラー
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("依存ライブラリ/認証情報が使用不可: {0}")]
    Dependency(String),
    #[error("音声形式または設定が不正: {0}")]
    InvalidFormat(String),
    #[error("API エラー: {0}")]
    Api(String),
    #[error("タイムアウト: {0}")]
    Timeout(String),
    #[error("未対応の操作: {0}")]
    Unsupported(String),
    #[error("予期しないエラー: {0}")]
    Other(String),
}

impl ProviderError {
    /// 対応するエラー種別
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Dependency(_) => ErrorKind::DependencyUnavailable,
            ProviderError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            ProviderError::Api(_) => ErrorKind::ApiError,
            ProviderError::Timeout(_) => ErrorKind::Timeout,
            ProviderError::Unsupported(_) => ErrorKind::UnsupportedOperation,
            ProviderError::Other(_) => ErrorKind::Exception,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else {
            ProviderError::Api(e.to_string())
        }
    }
}

/// 音声認識の呼び出しパラメータ
///
/// パイプラインのリトライ戦略はこの値を変えて同じプロバイダを再度呼ぶ。
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOptions {
    /// 音響モデル名（"default", "phone_call" など）
    pub model: String,
    pub sample_rate_hz: u32,
    /// 拡張モデルを使うか
    pub use_enhanced: bool,
    pub enable_punctuation: bool,
    pub max_alternatives: u32,
    /// 1回の呼び出しのタイムアウト
    pub timeout: Duration,
}

impl Default for RecognitionOptions {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            sample_rate_hz: 16000,
            use_enhanced: true,
            enable_punctuation: true,
            max_alternatives: 1,
            timeout: Duration::from_secs(15),
        }
    }
}

/// 音声合成の呼び出しパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisOptions {
    pub voice_id: String,
    pub timeout: Duration,
}

/// 音声プロバイダの共通トレイト
///
/// 認識・合成のどちらか（または両方）を実装する。対応しない操作は
/// デフォルト実装が `Unsupported` を返す。提供機能は `capabilities()` で宣言し、
/// 登録時に一度だけ読み取られる。
#[async_trait]
pub trait VoiceProvider: Send + Sync {
    /// プロバイダ名（一意）
    fn id(&self) -> &str;

    /// 提供機能
    fn capabilities(&self) -> Capabilities;

    /// 死活確認
    ///
    /// `capabilities().health_check` が false のプロバイダでは呼ばれない。
    async fn test_connection(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }

    /// 音声認識
    async fn transcribe(
        &self,
        _audio: &[u8],
        _language: &str,
        _options: &RecognitionOptions,
    ) -> Result<TranscriptionResult, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} は音声認識に対応していません",
            self.id()
        )))
    }

    /// 音声合成
    async fn synthesize(
        &self,
        _text: &str,
        _language: &str,
        _options: &SynthesisOptions,
    ) -> Result<SynthesisResult, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} は音声合成に対応していません",
            self.id()
        )))
    }
}

/// 設定からプロバイダを作成
pub async fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn VoiceProvider>> {
    let provider: Arc<dyn VoiceProvider> = match config.kind {
        ProviderKind::Whisper => {
            log::info!("{}: OpenAI Whisper API バックエンドを使用", config.id);
            Arc::new(WhisperBackend::new(config).context("Whisper API バックエンド作成失敗")?)
        }
        ProviderKind::Google => {
            log::info!("{}: Google Speech-to-Text バックエンドを使用", config.id);
            Arc::new(
                GoogleSpeechBackend::new(config)
                    .context("Google Speech-to-Text バックエンド作成失敗")?,
            )
        }
        ProviderKind::Aws => {
            log::info!("{}: Amazon Transcribe バックエンドを使用", config.id);
            Arc::new(
                AwsTranscribeBackend::new(config)
                    .await
                    .context("Amazon Transcribe バックエンド作成失敗")?,
            )
        }
        ProviderKind::OpenaiTts => {
            log::info!("{}: OpenAI TTS バックエンドを使用", config.id);
            Arc::new(OpenAiTtsBackend::new(config).context("OpenAI TTS バックエンド作成失敗")?)
        }
    };
    Ok(provider)
}

/// プロバイダ呼び出しをタイムアウト付きで実行し、パニックも捕捉する
///
/// 戻り値は常に `Result` で、時間切れは `Timeout`、パニックは `Other` になる。
pub(crate) async fn call_guarded<T, F>(timeout: Duration, call: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Err(_) => Err(ProviderError::Timeout(format!(
            "{:?} 以内に応答がありませんでした",
            timeout
        ))),
        Ok(Err(panic)) => Err(ProviderError::Other(format!(
            "プロバイダ内部でパニック: {}",
            panic_message(panic.as_ref())
        ))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "不明なパニック".to_string()
    }
}

/// APIキーを設定または環境変数から取得
pub(crate) fn resolve_api_key(config: &ProviderConfig, env_var: &str) -> Option<String> {
    config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}


#[cfg(test)]
mod tests {
    use super::*;

    struct RecognitionOnly;

    #[async_trait]
    impl VoiceProvider for RecognitionOnly {
        fn id(&self) -> &str {
            "local"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::recognition().without_health_check()
        }
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            ProviderError::Dependency("x".into()).kind(),
            ErrorKind::DependencyUnavailable
        );
        assert_eq!(ProviderError::Api("x".into()).kind(), ErrorKind::ApiError);
        assert_eq!(ProviderError::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            ProviderError::Unsupported("x".into()).kind(),
            ErrorKind::UnsupportedOperation
        );
        assert_eq!(ProviderError::Other("x".into()).kind(), ErrorKind::Exception);
    }

    #[tokio::test]
    async fn test_default_methods() {
        let provider = RecognitionOnly;
        assert!(provider.test_connection().await.unwrap());

        let err = provider
            .synthesize(
                "hello",
                "en-US",
                &SynthesisOptions {
                    voice_id: "alloy".to_string(),
                    timeout: Duration::from_secs(1),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_guarded_timeout() {
        let result: Result<(), ProviderError> = call_guarded(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_call_guarded_contains_panic() {
        let result: Result<(), ProviderError> = call_guarded(Duration::from_secs(1), async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Exception);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_call_guarded_passes_through() {
        let ok: Result<u32, ProviderError> =
            call_guarded(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, ProviderError> = call_guarded(Duration::from_secs(1), async {
            Err(ProviderError::Api("503".to_string()))
        })
        .await;
        assert_eq!(err.unwrap_err().kind(), ErrorKind::ApiError);
    }

    #[test]
    fn test_resolve_api_key_prefers_config() {
        let mut config = ProviderConfig::new("whisper", ProviderKind::Whisper);
        config.api_key = Some("from-config".to_string());
        assert_eq!(
            resolve_api_key(&config, "VOICE_FAILOVER_TEST_UNSET_KEY").as_deref(),
            Some("from-config")
        );

        config.api_key = None;
        assert!(resolve_api_key(&config, "VOICE_FAILOVER_TEST_UNSET_KEY").is_none());
    }
}
