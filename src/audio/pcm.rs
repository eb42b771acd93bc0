//! Raw PCM shaping: capture sample conversion, gain with saturation, RMS,
//! tone synthesis and the WAV container handed to remote services.

use std::f32::consts::PI;
use std::io::Cursor;

use crate::Result;

/// Converts the bus' wide capture container into 16-bit samples.
#[derive(Debug, Clone, Copy)]
pub struct SampleConverter {
    /// Right shift that drops the extra container bits
    pub shift: u32,
    /// Fixed digital gain applied after the shift
    pub gain: f32,
}

impl SampleConverter {
    pub fn convert(&self, raw: i32) -> i16 {
        let shifted = raw >> self.shift.min(31);
        saturate(shifted as f32 * self.gain)
    }

    /// Convert a block of raw samples, appending little-endian bytes to `out`.
    pub fn convert_block(&self, raw: &[i32], out: &mut Vec<u8>) {
        out.reserve(raw.len() * 2);
        for &sample in raw {
            out.extend_from_slice(&self.convert(sample).to_le_bytes());
        }
    }
}

fn saturate(value: f32) -> i16 {
    value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Scale one sample, clamping to the 16-bit range.
pub fn scale_sample(sample: i16, gain: f32) -> i16 {
    saturate(sample as f32 * gain)
}

/// Apply `gain` to 16-bit little-endian PCM in place. A trailing odd byte is
/// left untouched.
pub fn apply_gain(pcm: &mut [u8], gain: f32) {
    for pair in pcm.chunks_exact_mut(2) {
        let scaled = scale_sample(i16::from_le_bytes([pair[0], pair[1]]), gain);
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

/// Root-mean-square of 16-bit little-endian PCM. Empty input is 0.
pub fn rms(pcm: &[u8]) -> f32 {
    let count = pcm.len() / 2;
    if count == 0 {
        return 0.0;
    }
    let sum_squares: f64 = pcm
        .chunks_exact(2)
        .map(|b| {
            let s = i16::from_le_bytes([b[0], b[1]]) as f64;
            s * s
        })
        .sum();
    (sum_squares / count as f64).sqrt() as f32
}

/// Sine tone at half of full scale, as 16-bit little-endian mono PCM.
pub fn tone(frequency_hz: f32, duration_ms: u32, sample_rate: u32) -> Vec<u8> {
    let samples = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    let mut out = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let angle = 2.0 * PI * frequency_hz * i as f32 / sample_rate as f32;
        let s = (i16::MAX as f32 * angle.sin() * 0.5) as i16;
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Share of near-silent and near-clipped samples, as percentages.
pub fn quality(pcm: &[u8]) -> (f32, f32) {
    let count = pcm.len() / 2;
    if count == 0 {
        return (0.0, 0.0);
    }
    let (mut silent, mut clipped) = (0usize, 0usize);
    for b in pcm.chunks_exact(2) {
        let s = i16::from_le_bytes([b[0], b[1]]).unsigned_abs();
        if s < 100 {
            silent += 1;
        }
        if s > 30000 {
            clipped += 1;
        }
    }
    (
        silent as f32 * 100.0 / count as f32,
        clipped as f32 * 100.0 / count as f32,
    )
}

/// Wrap 16-bit little-endian PCM in a RIFF/WAVE container.
pub fn to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        {
            let mut samples = writer.get_i16_writer((pcm.len() / 2) as u32);
            for b in pcm.chunks_exact(2) {
                samples.write_sample(i16::from_le_bytes([b[0], b[1]]));
            }
            samples.flush()?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}
