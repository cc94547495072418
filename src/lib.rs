//! voice-failover - 音声認識・音声合成プロバイダのフェイルオーバーエンジン
//!
//! このクレートは、複数の交換可能な音声プロバイダ（Google / Whisper / Amazon Transcribe /
//! OpenAI TTS など）へリクエストを振り分け、個々のプロバイダ障害があっても
//! 呼び出し元のリクエストを失敗させないための仕組みを提供します。
//!
//! # 主な機能
//!
//! - **フェイルオーバー選択**: 戦略（無効 / 順序 / 可用性 / 品質）に従ってアクティブプロバイダを決定
//! - **ヘルスモニタ**: バックグラウンドで定期的に死活確認し、プライマリへの自動復帰を行う
//! - **適応型文字起こし**: 音声品質を解析し、必要な前処理とリトライ戦略を適用
//! - **サービスマネージャ**: 候補プロバイダを順に試し、最初の成功を返す
//!
//! # アーキテクチャ
//!
//! ```text
//! [呼び出し元] → [ServiceManager] → [failover::candidate_order]
//!                      │                       ↓
//!                      │            候補ごとに [TranscriptionPipeline]
//!                      │               ├─ [AudioQualityAnalyzer]
//!                      │               ├─ [AudioPreprocessor]
//!                      │               └─ [VoiceProvider] (初回 + リトライ)
//!                      ↓
//!               [SharedState] ← [HealthMonitor] (定期チェック)
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use voice_failover::config::Config;
//! use voice_failover::manager::ServiceManager;
//! use voice_failover::provider::build_provider;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load_or_default("config.toml")?;
//! let manager = ServiceManager::from_config(&config);
//! for provider in &config.providers {
//!     manager.register_provider(build_provider(provider).await?);
//! }
//! manager.start().await;
//!
//! let audio = std::fs::read("sample.wav")?;
//! let result = manager.transcribe(&audio, &config.stt.default_language).await;
//! println!("{}", serde_json::to_string(&result)?);
//!
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod audio_quality;
pub mod aws_transcribe;
pub mod config;
pub mod failover;
pub mod google_speech;
pub mod health;
pub mod manager;
pub mod openai_tts;
pub mod pipeline;
pub mod preprocess;
pub mod provider;
pub mod state;
pub mod types;
pub mod wav;
pub mod whisper_api;
