//! Audio loading and the log-mel frontend.
//!
//! The frontend matches the Voxtral/Whisper reference: periodic Hann
//! window, DFT expressed as matmuls against precomputed cosine/sine
//! tables, Slaney-style mel filter bank, log10 clamp and `(x + 4) / 4`
//! rescale. Two entry points share the per-frame pipeline:
//! `log_mel_offline` (reflect padding, drops the trailing frame) and
//! `log_mel_step` (streaming, zero seed, carries a PCM tail).

use std::path::Path;
use std::sync::OnceLock;

use mlx_rs::ops;
use mlx_rs::Array;

use crate::error::{Error, Result};

/// Target sample rate for the whole pipeline.
pub const SAMPLE_RATE: u32 = 16_000;
/// Mel filter bank size.
pub const N_MELS: i32 = 128;
/// STFT window / FFT size (25 ms at 16 kHz).
pub const N_FFT: usize = 400;
/// STFT hop (10 ms at 16 kHz).
pub const HOP_LENGTH: usize = 160;
/// Frequency bins: n_fft / 2 + 1.
pub const N_FREQS: usize = N_FFT / 2 + 1;
/// Stock upper clamp reference for log-mel values; checkpoints carry their
/// own `global_log_mel_max` and that value is what callers pass through.
pub const GLOBAL_LOG_MEL_MAX: f32 = 1.5;
/// Raw PCM samples per decoder position (80 ms at 16 kHz).
pub const SAMPLES_PER_TOKEN: usize = HOP_LENGTH * 2 * 4;

const MIN_POWER: f32 = 1e-10;

// ── Static tables ────────────────────────────────────────────────────────────

struct MelTables {
    /// Periodic Hann window, shape [n_fft]
    window: Array,
    /// DFT cosine table, shape [n_fft, n_freqs]
    dft_cos_t: Array,
    /// DFT sine table, shape [n_fft, n_freqs]
    dft_sin_t: Array,
    /// Mel filter bank, shape [n_freqs, n_mels]
    mel_filters_t: Array,
}

fn tables() -> &'static MelTables {
    static TABLES: OnceLock<MelTables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn build_tables() -> MelTables {
    // Hann(n_fft + 1)[:-1], i.e. the periodic window.
    let window: Vec<f32> = (0..N_FFT)
        .map(|i| {
            let angle = 2.0 * std::f32::consts::PI * (i as f32) / (N_FFT as f32);
            0.5 * (1.0 - angle.cos())
        })
        .collect();

    let mut cos_t = vec![0.0f32; N_FFT * N_FREQS];
    let mut sin_t = vec![0.0f32; N_FFT * N_FREQS];
    for n in 0..N_FFT {
        for k in 0..N_FREQS {
            let angle = 2.0 * std::f32::consts::PI * (k as f32) * (n as f32) / (N_FFT as f32);
            cos_t[n * N_FREQS + k] = angle.cos();
            sin_t[n * N_FREQS + k] = angle.sin();
        }
    }

    let filters = build_mel_filters();
    let mut filters_t = vec![0.0f32; N_FREQS * (N_MELS as usize)];
    for m in 0..(N_MELS as usize) {
        for k in 0..N_FREQS {
            filters_t[k * (N_MELS as usize) + m] = filters[m * N_FREQS + k];
        }
    }

    MelTables {
        window: Array::from_slice(&window, &[N_FFT as i32]),
        dft_cos_t: Array::from_slice(&cos_t, &[N_FFT as i32, N_FREQS as i32]),
        dft_sin_t: Array::from_slice(&sin_t, &[N_FFT as i32, N_FREQS as i32]),
        mel_filters_t: Array::from_slice(&filters_t, &[N_FREQS as i32, N_MELS]),
    }
}

/// Whisper-style Hz -> mel: linear below 1 kHz, logarithmic above.
fn hertz_to_mel(freq: f32) -> f32 {
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    let log_step = 27.0 / 6.4f32.ln();
    if freq >= MIN_LOG_HZ {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() * log_step
    } else {
        3.0 * freq / 200.0
    }
}

fn mel_to_hertz(mel: f32) -> f32 {
    const MIN_LOG_HZ: f32 = 1000.0;
    const MIN_LOG_MEL: f32 = 15.0;
    let log_step = 6.4f32.ln() / 27.0;
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step * (mel - MIN_LOG_MEL)).exp()
    } else {
        200.0 * mel / 3.0
    }
}

/// Triangular filters over [0, 8000] Hz with 2/(right-left) area norm.
fn build_mel_filters() -> Vec<f32> {
    let n_mels = N_MELS as usize;

    let fft_freqs: Vec<f32> = (0..N_FREQS)
        .map(|f| (f as f32) * (SAMPLE_RATE as f32) / (N_FFT as f32))
        .collect();

    let mel_min = hertz_to_mel(0.0);
    let mel_max = hertz_to_mel((SAMPLE_RATE as f32) / 2.0);
    let filter_freqs: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hertz(mel_min + (mel_max - mel_min) * (i as f32) / ((n_mels + 1) as f32)))
        .collect();

    let mut filters = vec![0.0f32; n_mels * N_FREQS];
    for m in 0..n_mels {
        let left = filter_freqs[m];
        let center = filter_freqs[m + 1];
        let right = filter_freqs[m + 2];
        let enorm = 2.0 / (right - left);
        for k in 0..N_FREQS {
            let down = (fft_freqs[k] - left) / (center - left).max(1e-6);
            let up = (right - fft_freqs[k]) / (right - center).max(1e-6);
            filters[m * N_FREQS + k] = down.min(up).max(0.0) * enorm;
        }
    }
    filters
}

// ── Frame pipeline ───────────────────────────────────────────────────────────

/// Run the per-frame pipeline over `n_frames` hops of `padded`.
///
/// `log_mel_max` is the checkpoint's `global_log_mel_max`; values are
/// clamped below at `log_mel_max - 8`. Returns shape `(n_mels, n_frames)`.
fn mel_from_padded(padded: &[f32], n_frames: usize, log_mel_max: f32) -> Result<Array> {
    if n_frames == 0 {
        return Ok(Array::zeros::<f32>(&[N_MELS, 0])?);
    }

    let mut frames = vec![0.0f32; n_frames * N_FFT];
    for (t, frame) in frames.chunks_exact_mut(N_FFT).enumerate() {
        frame.copy_from_slice(&padded[t * HOP_LENGTH..t * HOP_LENGTH + N_FFT]);
    }
    let frames = Array::from_slice(&frames, &[n_frames as i32, N_FFT as i32]);

    let t = tables();
    let windowed = ops::multiply(&frames, &t.window)?;
    let re = ops::matmul(&windowed, &t.dft_cos_t)?;
    let im = ops::matmul(&windowed, &t.dft_sin_t)?;
    let power = ops::add(&ops::square(&re)?, &ops::square(&im)?)?;
    let mel = ops::matmul(&power, &t.mel_filters_t)?;

    let floored = ops::maximum(&mel, &mlx_rs::array!(MIN_POWER))?;
    let log10 = ops::log(&floored)?.multiply(mlx_rs::array!(std::f32::consts::LOG10_E))?;
    let clamped = ops::maximum(&log10, &mlx_rs::array!(log_mel_max - 8.0))?;
    let scaled = clamped
        .add(mlx_rs::array!(4.0))?
        .multiply(mlx_rs::array!(0.25))?;

    Ok(scaled.transpose_axes(&[1, 0])?)
}

/// Offline log-mel spectrogram with centered (reflect) padding.
///
/// `log_mel_max` comes from the checkpoint's audio encoding arguments.
/// The trailing frame is dropped, matching the reference magnitudes slice.
pub fn log_mel_offline(samples: &[f32], log_mel_max: f32) -> Result<Array> {
    if samples.is_empty() {
        return Ok(Array::zeros::<f32>(&[N_MELS, 0])?);
    }

    let half = N_FFT / 2;
    let mut padded = Vec::with_capacity(samples.len() + N_FFT);
    for i in (1..=half).rev() {
        padded.push(samples.get(i).copied().unwrap_or(0.0));
    }
    padded.extend_from_slice(samples);
    let len = samples.len();
    for i in 1..=half {
        let src = len.checked_sub(1 + i).unwrap_or(0);
        padded.push(samples.get(src).copied().unwrap_or(0.0));
    }

    let mut n_frames = if padded.len() >= N_FFT {
        1 + (padded.len() - N_FFT) / HOP_LENGTH
    } else {
        0
    };
    n_frames = n_frames.saturating_sub(1);
    mel_from_padded(&padded, n_frames, log_mel_max)
}

/// One streaming mel step.
///
/// Prepends `tail` (or `n_fft/2` zeros on the first call), computes every
/// full frame, and returns the unconsumed PCM suffix as the next tail. The
/// tail keeps the hop grid aligned with the offline transform, so it is at
/// least `n_fft - hop` samples once frames have been produced.
pub fn log_mel_step(
    chunk: &[f32],
    tail: Option<&[f32]>,
    log_mel_max: f32,
) -> Result<(Array, Vec<f32>)> {
    let mut buffer = match tail {
        Some(t) => t.to_vec(),
        None => vec![0.0f32; N_FFT / 2],
    };
    buffer.extend_from_slice(chunk);

    let n_frames = if buffer.len() >= N_FFT {
        1 + (buffer.len() - N_FFT) / HOP_LENGTH
    } else {
        0
    };
    let mel = mel_from_padded(&buffer, n_frames, log_mel_max)?;
    let new_tail = buffer.split_off(n_frames * HOP_LENGTH);
    Ok((mel, new_tail))
}

// ── File loading ─────────────────────────────────────────────────────────────

/// Load an audio file as 16 kHz mono f32 samples.
///
/// WAV only (PCM int or float); stereo is downmixed; other rates are
/// resampled.
pub fn load_audio(path: impl AsRef<Path>) -> Result<Vec<f32>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::MissingFile(path.display().to_string()));
    }

    let mut reader = hound::WavReader::open(path)
        .map_err(|e| Error::FailedToReadAudio(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            if spec.bits_per_sample == 0 || spec.bits_per_sample > 32 {
                return Err(Error::UnsupportedAudioFormat(format!(
                    "{}-bit integer PCM",
                    spec.bits_per_sample
                )));
            }
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.unwrap_or(0) as f32 / max_val)
                .collect()
        }
        hound::SampleFormat::Float => {
            reader.samples::<f32>().map(|s| s.unwrap_or(0.0)).collect()
        }
    };

    let mono: Vec<f32> = match spec.channels {
        0 => return Err(Error::UnsupportedAudioFormat("zero channels".to_string())),
        1 => samples,
        n => samples
            .chunks(n as usize)
            .map(|frame| frame.iter().sum::<f32>() / (n as f32))
            .collect(),
    };

    if spec.sample_rate == SAMPLE_RATE {
        Ok(mono)
    } else {
        resample(&mono, spec.sample_rate, SAMPLE_RATE)
    }
}

/// Resample mono audio between sample rates.
pub fn resample(samples: &[f32], from_hz: u32, to_hz: u32) -> Result<Vec<f32>> {
    if from_hz == to_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    use rubato::{FftFixedInOut, Resampler};

    let mut resampler = FftFixedInOut::<f32>::new(from_hz as usize, to_hz as usize, 1024, 1)
        .map_err(|e| Error::FailedToReadAudio(format!("resampler init failed: {e}")))?;

    let chunk_size = resampler.input_frames_max();
    let mut output = Vec::new();
    for chunk in samples.chunks(chunk_size) {
        let mut padded = chunk.to_vec();
        padded.resize(chunk_size, 0.0);
        let result = resampler
            .process(&[padded], None)
            .map_err(|e| Error::FailedToReadAudio(format!("resampling failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let expected = (samples.len() as f64 * to_hz as f64 / from_hz as f64).round() as usize;
    output.truncate(expected);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::transforms::eval;

    fn to_vec(arr: &Array) -> Vec<f32> {
        let c = ops::contiguous(arr).unwrap();
        eval([&c]).unwrap();
        c.try_as_slice::<f32>().unwrap().to_vec()
    }

    fn sine(hz: f32, secs: f32) -> Vec<f32> {
        let n = (secs * SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * hz * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn sine_produces_full_mel_rows() {
        let mel = log_mel_offline(&sine(440.0, 1.0), GLOBAL_LOG_MEL_MAX).unwrap();
        let shape = mel.shape();
        assert_eq!(shape[0], N_MELS);
        assert!(shape[1] > 0);
    }

    #[test]
    fn silence_is_clamped_constant() {
        // power 1e-10 -> log10 = -10 -> clamp -6.5 -> (x + 4) / 4 = -0.625
        let (mel, _) = log_mel_step(&vec![0.0f32; 1600], None, GLOBAL_LOG_MEL_MAX).unwrap();
        for v in to_vec(&mel) {
            assert!((v + 0.625).abs() < 1e-5, "got {v}");
        }
    }

    #[test]
    fn step_tail_follows_hop_grid() {
        let (_, tail) = log_mel_step(&vec![0.0f32; 1280], None, GLOBAL_LOG_MEL_MAX).unwrap();
        // 200 zeros + 1280 samples, 7 frames -> 1480 - 1120 = 360 retained.
        assert_eq!(tail.len(), 360);

        let (_, tail) = log_mel_step(&vec![0.0f32; 1280], Some(&tail), GLOBAL_LOG_MEL_MAX).unwrap();
        assert_eq!(tail.len(), 360);

        // Too short for a frame: everything is retained.
        let (mel, tail) = log_mel_step(&[0.0f32; 10], None, GLOBAL_LOG_MEL_MAX).unwrap();
        assert_eq!(mel.shape()[1], 0);
        assert_eq!(tail.len(), 210);
    }

    #[test]
    fn step_concat_matches_offline_interior_frames() {
        let samples = sine(440.0, 0.5);

        let offline = to_vec(&log_mel_offline(&samples, GLOBAL_LOG_MEL_MAX).unwrap());
        let offline_frames = {
            let m = log_mel_offline(&samples, GLOBAL_LOG_MEL_MAX).unwrap();
            m.shape()[1] as usize
        };

        let mut streamed = Vec::new();
        let mut frames = 0usize;
        let mut tail: Option<Vec<f32>> = None;
        for chunk in samples.chunks(1280) {
            let (mel, t) = log_mel_step(chunk, tail.as_deref(), GLOBAL_LOG_MEL_MAX).unwrap();
            frames += mel.shape()[1] as usize;
            streamed.push(mel);
            tail = Some(t);
        }
        let refs: Vec<&Array> = streamed.iter().collect();
        let streamed = to_vec(&ops::concatenate_axis(&refs, 1).unwrap());

        // Skip the first two frames (zero seed vs reflect pad) and any
        // trailing frames only one side produced.
        let common = frames.min(offline_frames);
        for m in 0..(N_MELS as usize) {
            for f in 2..common {
                let a = offline[m * offline_frames + f];
                let b = streamed[m * frames + f];
                assert!(
                    (a - b).abs() < 1e-3,
                    "mel[{m}][{f}] offline={a} streamed={b}"
                );
            }
        }
    }

    #[test]
    fn resample_identity_and_downsample() {
        let x = vec![1.0f32, 2.0, 3.0];
        assert_eq!(resample(&x, 16_000, 16_000).unwrap(), x);

        let long = sine(440.0, 1.0);
        let down = resample(&long, 16_000, 8_000).unwrap();
        assert_eq!(down.len(), 8_000);
    }
}
