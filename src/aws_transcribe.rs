use crate::config::ProviderConfig;
use crate::provider::{ProviderError, RecognitionOptions, VoiceProvider};
use crate::types::{Capabilities, ErrorKind, TranscriptionResult};
use crate::wav;
use anyhow::Result;
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_transcribestreaming::types::{
    AudioEvent, AudioStream, LanguageCode, MediaEncoding, TranscriptResultStream,
};
use aws_sdk_transcribestreaming::Client as AwsTranscribeClient;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::Blob;

/// 1チャンクあたりの秒数
const CHUNK_SECONDS: f32 = 0.5;

/// Amazon Transcribe Streaming バックエンド
///
/// 1リクエスト分の音声をストリームとして送り、確定結果だけを集める。
/// 軽量な疎通確認APIがないため死活確認は持たない（常に Available 扱い）。
pub struct AwsTranscribeBackend {
    id: String,
    client: AwsTranscribeClient,
}

impl AwsTranscribeBackend {
    pub async fn new(config: &ProviderConfig) -> Result<Self> {
        // AWS SDKクライアント初期化
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        Ok(Self {
            id: config.id.clone(),
            client: AwsTranscribeClient::new(&sdk_config),
        })
    }
}

fn language_code(language: &str) -> LanguageCode {
    match language {
        "ja-JP" => LanguageCode::JaJp,
        "en-US" => LanguageCode::EnUs,
        "zh-CN" => LanguageCode::ZhCn,
        other => LanguageCode::from(other),
    }
}

/// 中国語・日本語は単語間に空白を入れない
fn separator_for(language: &str) -> &'static str {
    if language.starts_with("zh") || language.starts_with("ja") {
        ""
    } else {
        " "
    }
}

/// 確定セグメントの集計
#[derive(Default)]
struct Collected {
    segments: Vec<String>,
    confidences: Vec<f64>,
}

impl Collected {
    fn into_result(self, provider_id: &str, language: &str) -> TranscriptionResult {
        let text = self.segments.join(separator_for(language));
        let text = text.trim();
        if text.is_empty() {
            return TranscriptionResult::failure(provider_id, ErrorKind::Silence, "No speech detected");
        }

        let confidence = if self.confidences.is_empty() {
            None
        } else {
            Some((self.confidences.iter().sum::<f64>() / self.confidences.len() as f64) as f32)
        };

        TranscriptionResult::success(provider_id, text, confidence, Vec::new())
    }
}

#[async_trait]
impl VoiceProvider for AwsTranscribeBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::recognition().without_health_check()
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        language: &str,
        options: &RecognitionOptions,
    ) -> Result<TranscriptionResult, ProviderError> {
        let decoded = wav::decode(audio)
            .map_err(|e| ProviderError::InvalidFormat(format!("{:#}", e)))?;
        let sample_rate = decoded.format.sample_rate;
        let pcm = wav::to_i16(&decoded.samples);
        let chunk_samples = ((sample_rate as f32 * CHUNK_SECONDS) as usize).max(1);

        log::debug!(
            "{}: Amazon Transcribe へ {} サンプル ({} Hz) を送信",
            self.id,
            pcm.len(),
            sample_rate
        );

        let input_stream = stream! {
            for chunk in pcm.chunks(chunk_samples) {
                let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
                yield Ok(AudioStream::AudioEvent(
                    AudioEvent::builder().audio_chunk(Blob::new(bytes)).build(),
                ));
            }
        };

        let request = async {
            let mut resp = self
                .client
                .start_stream_transcription()
                .language_code(language_code(language))
                .media_sample_rate_hertz(sample_rate as i32)
                .media_encoding(MediaEncoding::Pcm)
                .audio_stream(input_stream.into())
                .send()
                .await
                .map_err(|e| {
                    ProviderError::Api(format!("Transcribe API開始失敗: {}", DisplayErrorContext(&e)))
                })?;

            let mut collected = Collected::default();
            while let Some(event) = resp.transcript_result_stream.recv().await.map_err(|e| {
                ProviderError::Api(format!("Transcribe 結果受信失敗: {}", DisplayErrorContext(&e)))
            })? {
                match event {
                    TranscriptResultStream::TranscriptEvent(transcript_event) => {
                        let Some(transcript) = transcript_event.transcript else {
                            continue;
                        };
                        for result in transcript.results.unwrap_or_default() {
                            if result.is_partial {
                                continue;
                            }
                            let Some(alt) = result.alternatives.unwrap_or_default().into_iter().next()
                            else {
                                continue;
                            };
                            collected.confidences.extend(
                                alt.items.unwrap_or_default().iter().filter_map(|i| i.confidence),
                            );
                            if let Some(text) = alt.transcript {
                                collected.segments.push(text);
                            }
                        }
                    }
                    other => {
                        log::debug!("Transcribeイベント: {:?}", other);
                    }
                }
            }
            Ok::<_, ProviderError>(collected)
        };

        let collected = tokio::time::timeout(options.timeout, request)
            .await
            .map_err(|_| ProviderError::Timeout(format!("{:?} 以内に完了しませんでした", options.timeout)))??;

        Ok(collected.into_result(&self.id, language))
    }
}
