use crate::failover::{FailoverPolicy, FailoverStrategy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// フェイルオーバー設定
///
/// プロバイダの切り替え方針とヘルスチェックに関する設定。
///
/// # デフォルト値
///
/// - `strategy`: availability
/// - `primary`: "google"
/// - `failover`: [] (フェイルオーバー先なし)
/// - `auto_restore_primary`: true
/// - `health_check_interval_seconds`: 300 秒
/// - `health_check_timeout_seconds`: 5 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FailoverConfig {
    #[serde(default = "default_strategy")]
    pub strategy: FailoverStrategy,
    #[serde(default = "default_primary")]
    pub primary: String,
    #[serde(default = "default_failover")]
    pub failover: Vec<String>,
    #[serde(default = "default_auto_restore_primary")]
    pub auto_restore_primary: bool,
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_health_check_timeout_seconds")]
    pub health_check_timeout_seconds: u64,
}

/// 音声認識 (STT) 設定
///
/// # デフォルト値
///
/// - `default_language`: "zh-CN"
/// - `enhance_audio`: true (品質問題があれば前処理する)
/// - `max_retries`: 2 回
/// - `timeout_seconds`: 15 秒 (1回の呼び出し)
/// - `confidence_threshold`: 0.6 (これ未満ならリトライ)
/// - `request_deadline_seconds`: 60 秒 (リクエスト全体)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SttConfig {
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_enhance_audio")]
    pub enhance_audio: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_request_deadline_seconds")]
    pub request_deadline_seconds: u64,
}

/// 音声品質判定の閾値
///
/// 値はすべて16bitリニアスケール基準。経験的に決めた値なので設定で調整できる。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QualityConfig {
    #[serde(default = "default_min_duration_seconds")]
    pub min_duration_seconds: f64,
    #[serde(default = "default_low_volume_rms")]
    pub low_volume_rms: f64,
    #[serde(default = "default_clipping_peak")]
    pub clipping_peak: f64,
    #[serde(default = "default_min_signal_to_noise")]
    pub min_signal_to_noise: f64,
    #[serde(default = "default_high_pass_cutoff_hz")]
    pub high_pass_cutoff_hz: f32,
}

/// 音声合成 (TTS) 設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TtsConfig {
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// 出力設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// プロバイダバックエンドの種類
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI Whisper API
    Whisper,
    /// Google Cloud Speech-to-Text (REST)
    Google,
    /// Amazon Transcribe Streaming
    Aws,
    /// OpenAI TTS API
    OpenaiTts,
}

/// プロバイダ個別設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub region: Option<String>,
    pub voice: Option<String>,
    pub base_url: Option<String>,
    /// false の場合、死活確認を持たないプロバイダとして扱う（常に Available）
    #[serde(default = "default_health_check")]
    pub health_check: bool,
}

// Default functions
fn default_strategy() -> FailoverStrategy {
    FailoverStrategy::Availability
}

fn default_primary() -> String {
    "google".to_string()
}

fn default_failover() -> Vec<String> {
    Vec::new()
}

fn default_auto_restore_primary() -> bool {
    true
}

fn default_health_check_interval_seconds() -> u64 {
    300 // 5分
}

fn default_health_check_timeout_seconds() -> u64 {
    5
}

fn default_language() -> String {
    "zh-CN".to_string()
}

fn default_enhance_audio() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_seconds() -> u64 {
    15
}

fn default_confidence_threshold() -> f32 {
    0.6
}

fn default_request_deadline_seconds() -> u64 {
    60
}

fn default_min_duration_seconds() -> f64 {
    0.5
}

fn default_low_volume_rms() -> f64 {
    100.0
}

fn default_clipping_peak() -> f64 {
    32700.0 // 16bit最大値の近傍
}

fn default_min_signal_to_noise() -> f64 {
    5.0
}

fn default_high_pass_cutoff_hz() -> f32 {
    80.0
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_check() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failover: FailoverConfig::default(),
            stt: SttConfig::default(),
            quality: QualityConfig::default(),
            tts: TtsConfig::default(),
            output: OutputConfig::default(),
            providers: vec![
                ProviderConfig::new("google", ProviderKind::Google),
                ProviderConfig::new("whisper", ProviderKind::Whisper),
                ProviderConfig::new("openai_tts", ProviderKind::OpenaiTts),
            ],
        }
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            primary: default_primary(),
            failover: default_failover(),
            auto_restore_primary: default_auto_restore_primary(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            health_check_timeout_seconds: default_health_check_timeout_seconds(),
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            enhance_audio: default_enhance_audio(),
            max_retries: default_max_retries(),
            timeout_seconds: default_timeout_seconds(),
            confidence_threshold: default_confidence_threshold(),
            request_deadline_seconds: default_request_deadline_seconds(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_duration_seconds: default_min_duration_seconds(),
            low_volume_rms: default_low_volume_rms(),
            clipping_peak: default_clipping_peak(),
            min_signal_to_noise: default_min_signal_to_noise(),
            high_pass_cutoff_hz: default_high_pass_cutoff_hz(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            default_voice: default_voice(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            api_key: None,
            model: None,
            region: None,
            voice: None,
            base_url: None,
            health_check: default_health_check(),
        }
    }
}

impl FailoverConfig {
    /// 不変のフェイルオーバーポリシーを生成
    pub fn to_policy(&self) -> FailoverPolicy {
        FailoverPolicy {
            strategy: self.strategy,
            primary_provider_id: self.primary.clone(),
            failover_provider_ids: self.failover.clone(),
            auto_restore_primary: self.auto_restore_primary,
            health_check_interval_seconds: self.health_check_interval_seconds,
        }
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds)
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use voice_failover::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// 既存のファイルは上書きされる。
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    /// ファイルが存在しない場合はエラーにならず、デフォルト設定を返す。
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}
