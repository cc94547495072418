use crate::types::{AudioFormat, AudioQualityReport, QualityIssue};
use crate::wav::{self, FULL_SCALE};
use anyhow::{Context, Result};

/// 正規化後のピーク (dBFS)
const NORMALIZE_HEADROOM_DB: f32 = -0.1;
/// コンプレッサ設定
const COMPRESSOR_THRESHOLD_DB: f32 = -20.0;
const COMPRESSOR_RATIO: f32 = 4.0;
const COMPRESSOR_ATTACK_MS: f32 = 5.0;
const COMPRESSOR_RELEASE_MS: f32 = 50.0;

/// 音声前処理
///
/// 品質レポートで検出された問題に対応する処理だけを適用し、
/// 最後にプロバイダ標準フォーマット（モノラル・16kHz・16bit WAV）へ変換する。
///
/// | 問題 | 処理 |
/// |------|------|
/// | LowVolume | ピーク正規化 |
/// | PossibleClipping | ダイナミックレンジ圧縮 |
/// | Noise | ハイパスフィルタ (~80Hz) |
pub struct AudioPreprocessor {
    high_pass_cutoff_hz: f32,
}

impl AudioPreprocessor {
    pub fn new(high_pass_cutoff_hz: f32) -> Self {
        Self {
            high_pass_cutoff_hz,
        }
    }

    /// 前処理を実行して標準フォーマットのWAVを返す
    ///
    /// # Errors
    ///
    /// デコードまたはエンコードに失敗した場合にエラーを返す。
    /// 呼び出し側は元の音声で処理を続行する。
    pub fn process(&self, audio: &[u8], report: &AudioQualityReport) -> Result<Vec<u8>> {
        let decoded = wav::decode(audio).context("前処理用のデコードに失敗")?;
        let sample_rate = decoded.format.sample_rate;
        let mut samples = decoded.samples;

        if report.has(QualityIssue::LowVolume) {
            log::info!("音量正規化を適用");
            normalize(&mut samples);
        }

        if report.has(QualityIssue::PossibleClipping) {
            log::info!("クリッピング対策の圧縮を適用");
            compress_dynamic_range(&mut samples, sample_rate);
        }

        if report.has(QualityIssue::Noise) {
            log::info!("ハイパスフィルタ ({} Hz) を適用", self.high_pass_cutoff_hz);
            high_pass_filter(&mut samples, sample_rate, self.high_pass_cutoff_hz);
        }

        let target = AudioFormat::CANONICAL;
        let resampled = resample_linear(&samples, sample_rate, target.sample_rate);

        wav::encode_mono_i16(&wav::to_i16(&resampled), target.sample_rate)
            .context("前処理後のエンコードに失敗")
    }
}

fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// ピークが -0.1 dBFS になるよう増幅
fn normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak <= 0.0 {
        return;
    }

    let gain = FULL_SCALE * db_to_gain(NORMALIZE_HEADROOM_DB) / peak;
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// フィードフォワード型コンプレッサ
///
/// 包絡線が閾値を超えた分を 1/ratio に圧縮する。
fn compress_dynamic_range(samples: &mut [f32], sample_rate: u32) {
    let sr = sample_rate as f32;
    let attack = (-1.0 / (COMPRESSOR_ATTACK_MS / 1000.0 * sr)).exp();
    let release = (-1.0 / (COMPRESSOR_RELEASE_MS / 1000.0 * sr)).exp();

    let mut envelope = 0.0f32;
    for s in samples.iter_mut() {
        let level = s.abs();
        let coef = if level > envelope { attack } else { release };
        envelope = coef * envelope + (1.0 - coef) * level;

        if envelope <= 0.0 {
            continue;
        }

        let envelope_db = 20.0 * (envelope / FULL_SCALE).log10();
        if envelope_db > COMPRESSOR_THRESHOLD_DB {
            let reduction_db =
                (COMPRESSOR_THRESHOLD_DB - envelope_db) * (1.0 - 1.0 / COMPRESSOR_RATIO);
            *s *= db_to_gain(reduction_db);
        }
    }
}

/// 1次ハイパスフィルタ
fn high_pass_filter(samples: &mut [f32], sample_rate: u32, cutoff_hz: f32) {
    if samples.is_empty() || cutoff_hz <= 0.0 {
        return;
    }

    let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
    let dt = 1.0 / sample_rate as f32;
    let alpha = rc / (rc + dt);

    let mut prev_input = samples[0];
    let mut prev_output = samples[0];
    for s in samples.iter_mut().skip(1) {
        let input = *s;
        let output = alpha * (prev_output + input - prev_input);
        *s = output;
        prev_input = input;
        prev_output = output;
    }
}

/// 線形補間によるリサンプリング
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}
