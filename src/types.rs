use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 16ビット整数型のオーディオサンプル
///
/// PCM形式の音声データを表現するための型エイリアス。
/// -32768 から 32767 の範囲の値を取る。
pub type SampleI16 = i16;

/// オーディオフォーマット情報
///
/// 音声データのサンプリングレートとチャンネル数を保持する。
///
/// # Examples
///
/// ```
/// # use voice_failover::types::AudioFormat;
/// let format = AudioFormat::CANONICAL;
/// assert_eq!(format.sample_rate, 16000);
/// assert_eq!(format.channels, 1);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    /// サンプリングレート (Hz)
    pub sample_rate: u32,

    /// チャンネル数
    ///
    /// 1: モノラル, 2: ステレオ
    pub channels: u16,
}

impl AudioFormat {
    /// プロバイダへ送信する標準フォーマット（モノラル・16kHz・16bit）
    pub const CANONICAL: AudioFormat = AudioFormat {
        sample_rate: 16000,
        channels: 1,
    };
}

/// プロバイダの稼働状態
///
/// ヘルスモニタ、または失敗した文字起こし試行によって更新される。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// 未確認（登録直後）
    #[default]
    Unknown,
    /// 利用可能
    Available,
    /// 利用不可
    Unavailable,
    /// 性能低下（直近の呼び出しが失敗）
    Degraded,
    /// ヘルスチェック自体がエラー
    Error,
}

/// プロバイダが提供する機能
///
/// 登録時に一度だけ解決される。実行時にメソッドの有無を調べることはしない。
///
/// # Examples
///
/// ```
/// # use voice_failover::types::Capabilities;
/// let caps = Capabilities::recognition().without_health_check();
/// assert!(caps.recognition);
/// assert!(!caps.synthesis);
/// assert!(!caps.health_check);
/// ```
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct Capabilities {
    /// 音声認識 (STT)
    pub recognition: bool,
    /// 音声合成 (TTS)
    pub synthesis: bool,
    /// 死活確認 (`test_connection`) を持つか
    pub health_check: bool,
}

impl Capabilities {
    /// 音声認識のみ（死活確認あり）
    pub fn recognition() -> Self {
        Self {
            recognition: true,
            synthesis: false,
            health_check: true,
        }
    }

    /// 音声合成のみ（死活確認あり）
    pub fn synthesis() -> Self {
        Self {
            recognition: false,
            synthesis: true,
            health_check: true,
        }
    }

    /// 死活確認を持たないことを宣言
    pub fn without_health_check(mut self) -> Self {
        self.health_check = false;
        self
    }
}

/// 登録済みプロバイダの記述子
#[derive(Clone, Debug, Serialize)]
pub struct ProviderDescriptor {
    /// 一意なプロバイダ名
    pub id: String,
    pub capabilities: Capabilities,
    pub status: ProviderStatus,
    /// 最後にヘルスチェックした時刻
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            id: id.into(),
            capabilities,
            status: ProviderStatus::Unknown,
            last_checked_at: None,
        }
    }
}

/// 音声品質の問題タグ
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    /// 音声が短すぎる
    TooShort,
    /// 音量が小さい
    LowVolume,
    /// クリッピングの可能性
    PossibleClipping,
    /// ノイズが多い（ピーク/RMS比が小さい）
    Noise,
    /// 解析に失敗
    AnalysisFailed,
}

/// 音声品質レポート
///
/// リクエストごとに生成され、永続化はされない。
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct AudioQualityReport {
    pub duration_seconds: f64,
    pub channels: u16,
    pub sample_width_bytes: u16,
    pub frame_rate_hz: u32,
    /// RMS振幅（16bitリニアスケール）
    pub rms_amplitude: f64,
    pub max_amplitude: f64,
    /// ゼロを除いた最小絶対振幅
    pub min_amplitude: f64,
    pub issues: BTreeSet<QualityIssue>,
}

impl AudioQualityReport {
    /// 解析失敗時のレポート（追加情報なし）
    pub fn analysis_failed() -> Self {
        Self {
            issues: BTreeSet::from([QualityIssue::AnalysisFailed]),
            ..Default::default()
        }
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn has(&self, issue: QualityIssue) -> bool {
        self.issues.contains(&issue)
    }
}

/// エラー種別
///
/// 呼び出し元に返す構造化結果の `error_kind` に入る。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// プロバイダ/ライブラリが使用不可
    DependencyUnavailable,
    /// 入力や設定の形式が不正
    InvalidFormat,
    /// プロバイダが報告したエラー
    ApiError,
    /// 音声が検出されなかった
    Silence,
    /// 候補テキストがない
    NoAlternatives,
    /// 健全な候補プロバイダがない
    ProviderUnavailable,
    /// 機能の不一致
    UnsupportedOperation,
    /// 全プロバイダが失敗
    AllServicesFailed,
    /// 呼び出しタイムアウト
    Timeout,
    /// 予期しない障害
    Exception,
}

/// プロバイダ単位の失敗記録
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
}

/// 文字起こし結果
///
/// 試行ごとに1つ生成され、生成後は変更しない（`with_*` は新しい値を返す）。
///
/// # JSON出力例
///
/// ```json
/// {
///   "success": true,
///   "text": "你好",
///   "confidence": 0.92,
///   "alternatives": [],
///   "provider_id": "google",
///   "processing_time_seconds": 1.23,
///   "attempts": 1
/// }
/// ```
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TranscriptionResult {
    pub success: bool,
    pub text: String,
    /// 0.0 - 1.0（失敗時は None）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub alternatives: Vec<String>,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_quality: Option<AudioQualityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// このプロバイダへの呼び出し回数
    pub attempts: u32,
    /// 最良結果を出したリトライ戦略名
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProviderFailure>,
}

impl TranscriptionResult {
    /// 成功結果を作成
    ///
    /// # Examples
    ///
    /// ```
    /// # use voice_failover::types::TranscriptionResult;
    /// let result = TranscriptionResult::success("google", "你好", Some(0.9), vec![]);
    /// assert!(result.success);
    /// assert_eq!(result.confidence, Some(0.9));
    /// ```
    pub fn success(
        provider_id: impl Into<String>,
        text: impl Into<String>,
        confidence: Option<f32>,
        alternatives: Vec<String>,
    ) -> Self {
        Self {
            success: true,
            text: text.into(),
            confidence: confidence.map(|c| c.clamp(0.0, 1.0)),
            alternatives,
            provider_id: provider_id.into(),
            processing_time_seconds: None,
            audio_quality: None,
            error_kind: None,
            error_message: None,
            attempts: 1,
            strategy: None,
            failures: Vec::new(),
        }
    }

    /// 失敗結果を作成
    pub fn failure(
        provider_id: impl Into<String>,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            text: String::new(),
            confidence: None,
            alternatives: Vec::new(),
            provider_id: provider_id.into(),
            processing_time_seconds: None,
            audio_quality: None,
            error_kind: Some(error_kind),
            error_message: Some(error_message.into()),
            attempts: 1,
            strategy: None,
            failures: Vec::new(),
        }
    }

    pub fn with_audio_quality(mut self, report: AudioQualityReport) -> Self {
        self.audio_quality = Some(report);
        self
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time_seconds = Some(seconds);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn with_failures(mut self, failures: Vec<ProviderFailure>) -> Self {
        self.failures = failures;
        self
    }

    /// 失敗記録に変換
    pub fn to_failure(&self) -> Option<ProviderFailure> {
        if self.success {
            return None;
        }
        Some(ProviderFailure {
            provider_id: self.provider_id.clone(),
            error_kind: self.error_kind.unwrap_or(ErrorKind::Exception),
            error_message: self.error_message.clone().unwrap_or_default(),
        })
    }
}

/// 音声合成結果
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SynthesisResult {
    pub success: bool,
    /// 合成音声データ（JSONには含めない）
    #[serde(skip)]
    pub audio: Vec<u8>,
    /// 音声フォーマット ("wav" など)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ProviderFailure>,
}

impl SynthesisResult {
    pub fn success(
        provider_id: impl Into<String>,
        audio: Vec<u8>,
        format: impl Into<String>,
        voice_id: Option<String>,
    ) -> Self {
        Self {
            success: true,
            audio,
            format: Some(format.into()),
            provider_id: provider_id.into(),
            voice_id,
            processing_time_seconds: None,
            error_kind: None,
            error_message: None,
            failures: Vec::new(),
        }
    }

    pub fn failure(
        provider_id: impl Into<String>,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            audio: Vec::new(),
            format: None,
            provider_id: provider_id.into(),
            voice_id: None,
            processing_time_seconds: None,
            error_kind: Some(error_kind),
            error_message: Some(error_message.into()),
            failures: Vec::new(),
        }
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time_seconds = Some(seconds);
        self
    }

    pub fn with_failures(mut self, failures: Vec<ProviderFailure>) -> Self {
        self.failures = failures;
        self
    }

    pub fn to_failure(&self) -> Option<ProviderFailure> {
        if self.success {
            return None;
        }
        Some(ProviderFailure {
            provider_id: self.provider_id.clone(),
            error_kind: self.error_kind.unwrap_or(ErrorKind::Exception),
            error_message: self.error_message.clone().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_status_serialization() {
        let json = serde_json::to_string(&ProviderStatus::Degraded).unwrap();
        assert_eq!(json, r#""degraded""#);

        let deserialized: ProviderStatus = serde_json::from_str(r#""available""#).unwrap();
        assert_eq!(deserialized, ProviderStatus::Available);
    }

    #[test]
    fn test_descriptor_starts_unknown() {
        let descriptor = ProviderDescriptor::new("google", Capabilities::recognition());
        assert_eq!(descriptor.status, ProviderStatus::Unknown);
        assert!(descriptor.last_checked_at.is_none());
    }

    #[test]
    fn test_analysis_failed_report() {
        let report = AudioQualityReport::analysis_failed();
        assert!(report.has_issues());
        assert!(report.has(QualityIssue::AnalysisFailed));
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let result = TranscriptionResult::success("whisper", "hello", Some(1.5), vec![]);
        assert_eq!(result.confidence, Some(1.0));
    }

    #[test]
    fn test_failure_has_no_confidence() {
        let result = TranscriptionResult::failure("azure", ErrorKind::ApiError, "503");
        assert!(!result.success);
        assert!(result.confidence.is_none());

        let failure = result.to_failure().unwrap();
        assert_eq!(failure.provider_id, "azure");
        assert_eq!(failure.error_kind, ErrorKind::ApiError);
    }

    #[test]
    fn test_transcription_result_json_serialization() {
        let result = TranscriptionResult::success("google", "你好", Some(0.8), vec!["您好".to_string()])
            .with_processing_time(0.5);

        let json = serde_json::to_string(&result).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["provider_id"], "google");
        assert_eq!(parsed["alternatives"][0], "您好");
        assert!(parsed.get("error_kind").is_none());
        assert!(parsed.get("failures").is_none());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::AllServicesFailed).unwrap();
        assert_eq!(json, r#""all_services_failed""#);
    }
}
