use crate::config::ProviderConfig;
use crate::provider::{resolve_api_key, ProviderError, RecognitionOptions, VoiceProvider};
use crate::types::{Capabilities, ErrorKind, TranscriptionResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

pub(crate) const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "whisper-1";

/// OpenAI Whisper API レスポンス (verbose_json)
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    avg_logprob: f64,
}

/// OpenAI Whisper API バックエンド
pub struct WhisperBackend {
    id: String,
    api_key: Option<String>,
    model: String,
    base_url: String,
    health_check: bool,
    client: reqwest::Client,
}

impl WhisperBackend {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Whisper API HTTPクライアント作成失敗")?;

        let api_key = resolve_api_key(config, "OPENAI_API_KEY");
        if api_key.is_none() {
            log::warn!("{}: OpenAI API キーが設定されていません", config.id);
        }

        Ok(Self {
            id: config.id.clone(),
            api_key,
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
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
}

/// "zh-CN" → "zh"（Whisper は ISO-639-1 を受け付ける）
fn whisper_language(language: &str) -> &str {
    language.split(['-', '_']).next().unwrap_or(language)
}

/// セグメントの平均対数確率から信頼度を推定
fn confidence_from_segments(segments: &[WhisperSegment]) -> Option<f32> {
    if segments.is_empty() {
        return None;
    }
    let mean = segments.iter().map(|s| s.avg_logprob).sum::<f64>() / segments.len() as f64;
    Some(mean.exp().clamp(0.0, 1.0) as f32)
}

/// HTTPステータスをエラーに変換
pub(crate) fn status_error(status: StatusCode, body: String) -> ProviderError {
    let message = format!("{} - {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Dependency(message),
        StatusCode::BAD_REQUEST | StatusCode::UNSUPPORTED_MEDIA_TYPE => {
            ProviderError::InvalidFormat(message)
        }
        _ => ProviderError::Api(message),
    }
}

#[async_trait]
impl VoiceProvider for WhisperBackend {
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

    /// Whisper APIを呼び出して文字起こし
    async fn transcribe(
        &self,
        audio: &[u8],
        language: &str,
        options: &RecognitionOptions,
    ) -> Result<TranscriptionResult, ProviderError> {
        let api_key = self.api_key()?;

        let part = multipart::Part::bytes(audio.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        if !language.is_empty() {
            form = form.text("language", whisper_language(language).to_string());
        }

        // 拡張を無効にするリトライでは温度を上げて別の復号経路を試す
        if !options.use_enhanced {
            form = form.text("temperature", "0.2");
        }

        log::debug!("{}: Whisper API へ {} バイトを送信", self.id, audio.len());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .timeout(options.timeout)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, error_text));
        }

        let whisper_response: WhisperResponse = response
            .json::<WhisperResponse>()
            .await
            .map_err(|e| ProviderError::Api(format!("Whisper API レスポンスパース失敗: {}", e)))?;

        let text = whisper_response.text.trim();
        if text.is_empty() {
            return Ok(TranscriptionResult::failure(
                &self.id,
                ErrorKind::Silence,
                "No speech detected",
            ));
        }

        Ok(TranscriptionResult::success(
            &self.id,
            text,
            confidence_from_segments(&whisper_response.segments),
            Vec::new(),
        ))
    }
}
