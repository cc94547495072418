use crate::config::ProviderConfig;
use crate::provider::{resolve_api_key, ProviderError, RecognitionOptions, VoiceProvider};
use crate::types::{Capabilities, ErrorKind, TranscriptionResult};
use crate::whisper_api::status_error;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const GOOGLE_SPEECH_URL: &str = "https://speech.googleapis.com/v1";

/// speech:recognize リクエスト
#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    config: RecognitionConfig<'a>,
    audio: RecognitionAudio,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'static str,
    sample_rate_hertz: u32,
    language_code: &'a str,
    model: &'a str,
    use_enhanced: bool,
    enable_automatic_punctuation: bool,
    max_alternatives: u32,
}

#[derive(Debug, Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
}

#[derive(Debug, Deserialize)]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    confidence: Option<f32>,
}

/// Google Cloud Speech-to-Text (REST) バックエンド
///
/// モデル・サンプルレート・拡張モデルの指定をそのまま API に渡すため、
/// パイプラインのリトライ戦略が最も効くプロバイダ。
pub struct GoogleSpeechBackend {
    id: String,
    api_key: Option<String>,
    base_url: String,
    health_check: bool,
    client: reqwest::Client,
}

impl GoogleSpeechBackend {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Google Speech HTTPクライアント作成失敗")?;

        let api_key = resolve_api_key(config, "GOOGLE_API_KEY");
        if api_key.is_none() {
            log::warn!("{}: Google API キーが設定されていません", config.id);
        }

        Ok(Self {
            id: config.id.clone(),
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| GOOGLE_SPEECH_URL.to_string()),
            health_check: config.health_check,
            client,
        })
    }

    async fn recognize(
        &self,
        audio: &[u8],
        language: &str,
        options: &RecognitionOptions,
        timeout: Duration,
    ) -> Result<RecognizeResponse, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Dependency("Google API キーが未設定".to_string()))?;

        let request = RecognizeRequest {
            config: RecognitionConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: options.sample_rate_hz,
                language_code: language,
                model: &options.model,
                use_enhanced: options.use_enhanced,
                enable_automatic_punctuation: options.enable_punctuation,
                max_alternatives: options.max_alternatives,
            },
            audio: RecognitionAudio {
                content: base64::engine::general_purpose::STANDARD.encode(audio),
            },
        };

        let response = self
            .client
            .post(format!("{}/speech:recognize", self.base_url))
            .query(&[("key", api_key)])
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, error_text));
        }

        response
            .json::<RecognizeResponse>()
            .await
            .map_err(|e| ProviderError::Api(format!("Google レスポンスパース失敗: {}", e)))
    }

    fn to_result(&self, response: RecognizeResponse) -> TranscriptionResult {
        let Some(first) = response.results.into_iter().next() else {
            return TranscriptionResult::failure(&self.id, ErrorKind::Silence, "No speech detected");
        };

        let mut alternatives = first.alternatives.into_iter();
        let Some(best) = alternatives.next() else {
            return TranscriptionResult::failure(
                &self.id,
                ErrorKind::NoAlternatives,
                "No transcription alternatives",
            );
        };

        let others = alternatives.map(|a| a.transcript.trim().to_string()).collect();
        TranscriptionResult::success(&self.id, best.transcript.trim(), best.confidence, others)
    }
}

#[async_trait]
impl VoiceProvider for GoogleSpeechBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        let caps = Capabilities::recognition();
        if self.health_check {
            caps
        } else {
            caps.without_health_check()
        }
    }

    /// 最小限の認識リクエストで疎通確認
    async fn test_connection(&self) -> Result<bool, ProviderError> {
        if self.api_key.is_none() {
            return Ok(false);
        }

        let options = RecognitionOptions::default();
        match self
            .recognize(&[0u8; 100], "en-US", &options, Duration::from_secs(3))
            .await
        {
            Ok(_) => Ok(true),
            Err(ProviderError::Api(e)) | Err(ProviderError::InvalidFormat(e)) => {
                log::warn!("{}: 疎通確認に失敗: {}", self.id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        language: &str,
        options: &RecognitionOptions,
    ) -> Result<TranscriptionResult, ProviderError> {
        log::info!(
            "{}: Google へ文字起こしリクエスト (言語: {}, モデル: {})",
            self.id,
            language,
            options.model
        );
        let response = self.recognize(audio, language, options, options.timeout).await?;
        Ok(self.to_result(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn backend() -> GoogleSpeechBackend {
        let mut config = ProviderConfig::new("google", ProviderKind::Google);
        config.api_key = Some("test-key".to_string());
        GoogleSpeechBackend::new(&config).unwrap()
    }

    #[test]
    fn test_request_serialization() {
        let request = RecognizeRequest {
            config: RecognitionConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: 8000,
                language_code: "zh-CN",
                model: "phone_call",
                use_enhanced: false,
                enable_automatic_punctuation: true,
                max_alternatives: 1,
            },
            audio: RecognitionAudio {
                content: base64::engine::general_purpose::STANDARD.encode(b"Hello World"),
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["config"]["sampleRateHertz"], 8000);
        assert_eq!(json["config"]["languageCode"], "zh-CN");
        assert_eq!(json["config"]["model"], "phone_call");
        assert_eq!(json["config"]["useEnhanced"], false);
        assert_eq!(json["audio"]["content"], "SGVsbG8gV29ybGQ=");
    }

    #[test]
    fn test_empty_results_is_silence() {
        let response: RecognizeResponse = serde_json::from_str("{}").unwrap();
        let result = backend().to_result(response);

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Silence));
    }

    #[test]
    fn test_no_alternatives() {
        let response: RecognizeResponse =
            serde_json::from_str(r#"{"results": [{"alternatives": []}]}"#).unwrap();
        let result = backend().to_result(response);

        assert_eq!(result.error_kind, Some(ErrorKind::NoAlternatives));
    }

    #[test]
    fn test_best_alternative_and_secondaries() {
        let response: RecognizeResponse = serde_json::from_str(
            r#"{"results": [{"alternatives": [
                {"transcript": " 你好 ", "confidence": 0.87},
                {"transcript": "您好"}
            ]}]}"#,
        )
        .unwrap();
        let result = backend().to_result(response);

        assert!(result.success);
        assert_eq!(result.text, "你好");
        assert_eq!(result.confidence, Some(0.87));
        assert_eq!(result.alternatives, vec!["您好".to_string()]);
        assert_eq!(result.provider_id, "google");
    }
}
