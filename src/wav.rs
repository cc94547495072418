use crate::types::{AudioFormat, SampleI16};
use anyhow::{Context, Result};
use std::io::Cursor;

/// 16bit フルスケール
pub const FULL_SCALE: f32 = 32768.0;

/// デコード済み音声
///
/// サンプルはモノラルに畳み込み済みで、16bitリニアスケールの f32。
#[derive(Clone, Debug)]
pub struct DecodedAudio {
    /// 元ファイルのフォーマット（チャンネル数は畳み込み前の値）
    pub format: AudioFormat,
    pub bits_per_sample: u16,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.format.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.format.sample_rate as f64
    }

    pub fn sample_width_bytes(&self) -> u16 {
        self.bits_per_sample.div_ceil(8)
    }
}

/// WAVバイト列をデコード
///
/// 8/16/24/32bit整数と32bit浮動小数点に対応。多チャンネルは平均でモノラル化する。
pub fn decode(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("WAVヘッダの読み込みに失敗")?;
    let spec = reader.spec();

    if spec.sample_rate == 0 || spec.channels == 0 {
        anyhow::bail!(
            "不正なWAVフォーマット: {} Hz / {} ch",
            spec.sample_rate,
            spec.channels
        );
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = FULL_SCALE / (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .context("WAVサンプルの読み込みに失敗")?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| v * FULL_SCALE))
            .collect::<Result<_, _>>()
            .context("WAVサンプルの読み込みに失敗")?,
    };

    let channels = spec.channels as usize;
    let samples = if channels > 1 {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        interleaved
    };

    Ok(DecodedAudio {
        format: AudioFormat {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        },
        bits_per_sample: spec.bits_per_sample,
        samples,
    })
}

/// PCMデータをWAVフォーマットに変換（モノラル・16bit）
pub fn encode_mono_i16(pcm_data: &[SampleI16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("WAVライター作成失敗")?;

        for &sample in pcm_data {
            writer.write_sample(sample).context("WAV書き込み失敗")?;
        }

        writer.finalize().context("WAV finalize失敗")?;
    }

    Ok(cursor.into_inner())
}

/// f32 (16bitスケール) を i16 に丸めて変換
pub fn to_i16(samples: &[f32]) -> Vec<SampleI16> {
    samples
        .iter()
        .map(|&s| s.round().clamp(i16::MIN as f32, i16::MAX as f32) as SampleI16)
        .collect()
}

#[cfg(test)]
pub(crate) fn stereo_i16(left: &[i16], right: &[i16], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for (l, r) in left.iter().zip(right) {
            writer.write_sample(*l).unwrap();
            writer.write_sample(*r).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}
