use crate::config::ProviderConfig;
use crate::provider::{resolve_api_key, ProviderError, SynthesisOptions, VoiceProvider};
use crate::types::{Capabilities, SynthesisResult};
use crate::whisper_api::{status_error, OPENAI_BASE_URL};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

const DEFAULT_MODEL: &str = "tts-1";
const DEFAULT_VOICE: &str = "alloy";

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

/// OpenAI TTS API バックエンド
pub struct OpenAiTtsBackend {
    id: String,
    api_key: Option<String>,
    model: String,
    default_voice: Option<String>,
    base_url: String,
    health_check: bool,
    client: reqwest::Client,
}

impl OpenAiTtsBackend {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("OpenAI TTS HTTPクライアント作成失敗")?;

        Ok(Self {
            id: config.id.clone(),
            api_key: resolve_api_key(config, "OPENAI_API_KEY"),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            default_voice: config.voice.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            health_check: config.health_check,
            client,
        })
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Dependency("OpenAI API キーが未設定".to_string()))
    }

    /// 呼び出し側の指定を優先し、空なら設定のボイスを使う
    fn resolve_voice<'a>(&'a self, requested: &'a str) -> &'a str {
        if !requested.is_empty() {
            return requested;
        }
        self.default_voice.as_deref().unwrap_or(DEFAULT_VOICE)
    }
}

#[async_trait]
impl VoiceProvider for OpenAiTtsBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        let caps = Capabilities::synthesis();
        if self.health_check {
            caps
        } else {
            caps.without_health_check()
        }
    }

    async fn test_connection(&self) -> Result<bool, ProviderError> {
        let Ok(api_key) = self.api_key() else {
            return Ok(false);
        };

        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .timeout(Duration::from_secs(3))
            .send()
            .await?;

        Ok(response.status().is_success())
    }

    async fn synthesize(
        &self,
        text: &str,
        _language: &str,
        options: &SynthesisOptions,
    ) -> Result<SynthesisResult, ProviderError> {
        let api_key = self.api_key()?;
        let voice = self.resolve_voice(&options.voice_id);

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: "wav",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .timeout(options.timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, error_text));
        }

        let audio = response.bytes().await?;
        log::debug!("{}: 合成音声 {} バイトを受信", self.id, audio.len());

        Ok(SynthesisResult::success(
            &self.id,
            audio.to_vec(),
            "wav",
            Some(voice.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::types::ErrorKind;

    #[test]
    fn test_backend_creation() {
        let mut config = ProviderConfig::new("openai_tts", ProviderKind::OpenaiTts);
        config.voice = Some("nova".to_string());

        let backend = OpenAiTtsBackend::new(&config).unwrap();
        assert_eq!(backend.model, "tts-1");
        assert!(backend.capabilities().synthesis);
        assert!(!backend.capabilities().recognition);
    }

    #[test]
    fn test_requested_voice_wins_over_config() {
        let mut config = ProviderConfig::new("openai_tts", ProviderKind::OpenaiTts);
        config.voice = Some("echo".to_string());
        let backend = OpenAiTtsBackend::new(&config).unwrap();

        assert_eq!(backend.resolve_voice("nova"), "nova");
        assert_eq!(backend.resolve_voice(""), "echo");

        let unconfigured =
            OpenAiTtsBackend::new(&ProviderConfig::new("openai_tts", ProviderKind::OpenaiTts))
                .unwrap();
        assert_eq!(unconfigured.resolve_voice(""), "alloy");
        assert_eq!(unconfigured.resolve_voice("shimmer"), "shimmer");
    }

    #[test]
    fn test_request_serialization() {
        let request = SpeechRequest {
            model: "tts-1",
            input: "你好",
            voice: "alloy",
            response_format: "wav",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["voice"], "alloy");
        assert_eq!(json["response_format"], "wav");
    }

    #[tokio::test]
    async fn test_transcribe_is_unsupported() {
        let config = ProviderConfig::new("openai_tts", ProviderKind::OpenaiTts);
        let backend = OpenAiTtsBackend::new(&config).unwrap();

        let err = backend
            .transcribe(b"", "zh-CN", &Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }
}
