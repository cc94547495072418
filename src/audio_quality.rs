use crate::config::QualityConfig;
use crate::types::{AudioQualityReport, QualityIssue};
use crate::wav::{self, DecodedAudio};
use std::collections::BTreeSet;

/// ゼロ除算防止用の微小値
const EPSILON: f64 = 1e-10;

/// 音声品質アナライザ
///
/// 生の音声を解析し、長さ・RMS・ピーク振幅（多チャンネルはモノラル化して計算）から
/// 問題タグを付与したレポートを作る。
///
/// # 判定基準（デフォルト）
///
/// - 長さ 0.5 秒未満 → TooShort
/// - RMS 100 未満 → LowVolume
/// - ピーク 32700 超 → PossibleClipping
/// - ピーク / RMS が 5 未満 → Noise
///
/// 解析に失敗しても処理は止めず、`AnalysisFailed` のみのレポートを返す。
///
/// # Examples
///
/// ```
/// # use voice_failover::audio_quality::AudioQualityAnalyzer;
/// # use voice_failover::config::QualityConfig;
/// # use voice_failover::types::QualityIssue;
/// let analyzer = AudioQualityAnalyzer::new(&QualityConfig::default());
/// let report = analyzer.analyze(b"garbage");
/// assert!(report.has(QualityIssue::AnalysisFailed));
/// ```
pub struct AudioQualityAnalyzer {
    thresholds: QualityConfig,
}

impl AudioQualityAnalyzer {
    pub fn new(thresholds: &QualityConfig) -> Self {
        Self {
            thresholds: thresholds.clone(),
        }
    }

    /// WAVバイト列を解析
    pub fn analyze(&self, audio: &[u8]) -> AudioQualityReport {
        match wav::decode(audio) {
            Ok(decoded) => self.analyze_decoded(&decoded),
            Err(e) => {
                log::warn!("音声解析に失敗: {:#}", e);
                AudioQualityReport::analysis_failed()
            }
        }
    }

    /// デコード済み音声を解析
    pub fn analyze_decoded(&self, audio: &DecodedAudio) -> AudioQualityReport {
        let duration_seconds = audio.duration_seconds();
        let rms = calculate_rms(&audio.samples);
        let max_amplitude = audio
            .samples
            .iter()
            .map(|s| s.abs() as f64)
            .fold(0.0, f64::max);
        let min_amplitude = audio
            .samples
            .iter()
            .map(|s| s.abs() as f64)
            .filter(|&s| s > 0.0)
            .fold(f64::INFINITY, f64::min);
        let min_amplitude = if min_amplitude.is_finite() {
            min_amplitude
        } else {
            0.0
        };

        let mut issues = BTreeSet::new();

        if duration_seconds < self.thresholds.min_duration_seconds {
            issues.insert(QualityIssue::TooShort);
        }

        if rms < self.thresholds.low_volume_rms {
            issues.insert(QualityIssue::LowVolume);
        }

        if max_amplitude > self.thresholds.clipping_peak {
            issues.insert(QualityIssue::PossibleClipping);
        }

        // 無音のときはS/N比を評価しない
        if rms > 0.0 {
            let signal_to_noise = max_amplitude / (rms + EPSILON);
            if signal_to_noise < self.thresholds.min_signal_to_noise {
                issues.insert(QualityIssue::Noise);
            }
        }

        log::debug!(
            "音声品質: {:.2}秒, RMS {:.1}, ピーク {:.0}, 問題 {:?}",
            duration_seconds,
            rms,
            max_amplitude,
            issues
        );

        AudioQualityReport {
            duration_seconds,
            channels: audio.format.channels,
            sample_width_bytes: audio.sample_width_bytes(),
            frame_rate_hz: audio.format.sample_rate,
            rms_amplitude: rms,
            max_amplitude,
            min_amplitude,
            issues,
        }
    }
}

/// RMS (Root Mean Square) を計算
fn calculate_rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_of_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_of_squares / samples.len() as f64).sqrt()
}
