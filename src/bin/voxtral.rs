//! Voxtral realtime CLI.
//!
//! `transcribe` runs the offline pipeline over an audio file; `live`
//! captures the default microphone and prints text fragments as they
//! become decodable. Press Enter to stop a live session cleanly.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use voxtral_realtime_mlx::{
    resolve_model, Error, RealtimeOptions, RealtimeSession, Result, TranscribeOptions,
    Transcriber, VoxtralModel,
};

#[derive(Parser)]
#[command(name = "voxtral", about = "Streaming speech-to-text with Voxtral on MLX")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Transcribe an audio file.
    Transcribe {
        /// Audio file (WAV).
        #[arg(long)]
        audio: PathBuf,
        /// Model directory or Hugging Face repo id.
        #[arg(long)]
        model: String,
        /// Sampling temperature; 0 is greedy.
        #[arg(long, default_value_t = 0.0)]
        temp: f32,
        /// Maximum generated tokens.
        #[arg(long, default_value_t = 1024)]
        max_new_tokens: usize,
        /// Print timing statistics.
        #[arg(long)]
        stats: bool,
    },
    /// Transcribe the default microphone in realtime.
    Live {
        /// Model directory or Hugging Face repo id.
        #[arg(long)]
        model: String,
        /// Sampling temperature; 0 is greedy.
        #[arg(long, default_value_t = 0.0)]
        temp: f32,
        /// Audio chunk duration in milliseconds.
        #[arg(long, default_value_t = 80)]
        chunk_ms: i64,
        /// Override the model's transcription delay.
        #[arg(long)]
        transcription_delay_ms: Option<usize>,
        /// Silence tokens appended when the stream ends.
        #[arg(long, default_value_t = 17)]
        right_pad_tokens: usize,
        /// Decoder KV window in tokens.
        #[arg(long)]
        decoder_window: Option<i32>,
        /// Drop microphone audio older than this backlog.
        #[arg(long, default_value_t = 5000)]
        max_backlog_ms: u64,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Transcribe {
            audio,
            model,
            temp,
            max_new_tokens,
            stats,
        } => run_transcribe(&audio, &model, temp, max_new_tokens, stats),
        Command::Live {
            model,
            temp,
            chunk_ms,
            transcription_delay_ms,
            right_pad_tokens,
            decoder_window,
            max_backlog_ms,
        } => run_live(
            &model,
            RealtimeOptions {
                temperature: temp,
                chunk_duration_ms: chunk_ms,
                transcription_delay_ms,
                right_pad_tokens,
                decoder_window_tokens: decoder_window,
            },
            max_backlog_ms,
        ),
    }
}

fn run_transcribe(
    audio: &PathBuf,
    model_spec: &str,
    temp: f32,
    max_new_tokens: usize,
    stats: bool,
) -> Result<()> {
    let dir = resolve_model(model_spec)?;
    let (model, tokenizer) = VoxtralModel::load(&dir)?;
    let mut transcriber = Transcriber::new(model, tokenizer)?;

    let options = TranscribeOptions {
        temperature: temp,
        max_new_tokens,
    };
    let result = transcriber.transcribe_file(audio, &options)?;

    println!("{}", result.text);
    if stats {
        let s = &result.stats;
        eprintln!();
        eprintln!("Audio:   {:.2}s", s.audio_secs);
        eprintln!("Encode:  {:.1} ms", s.encode_ms);
        eprintln!("Prefill: {:.1} ms", s.prefill_ms);
        eprintln!(
            "Decode:  {:.1} ms ({} tokens)",
            s.decode_ms, s.generated_tokens
        );
        eprintln!(
            "RTF:     {:.3}x ({:.1}x realtime)",
            s.real_time_factor(),
            1.0 / s.real_time_factor().max(1e-9)
        );
    }
    Ok(())
}

/// Microphone samples pending consumption, oldest first.
///
/// The capture callback drops the oldest samples above the backlog cap so
/// session latency stays bounded; the pipeline itself never drops audio.
struct MicQueue {
    samples: VecDeque<f32>,
    cap: usize,
    dropped: u64,
}

impl MicQueue {
    fn push(&mut self, samples: impl Iterator<Item = f32>) {
        for s in samples {
            if self.samples.len() == self.cap {
                self.samples.pop_front();
                self.dropped += 1;
            }
            self.samples.push_back(s);
        }
    }
}

/// Phase-continuous linear resampler for the capture thread's output.
///
/// `pos` is the source position of the next output sample, relative to the
/// current chunk; index -1 refers to the last sample of the previous chunk.
struct LinearResampler {
    step: f64,
    pos: f64,
    prev: f32,
    primed: bool,
}

impl LinearResampler {
    fn new(from_hz: u32, to_hz: u32) -> Self {
        Self {
            step: from_hz as f64 / to_hz as f64,
            pos: 0.0,
            prev: 0.0,
            primed: false,
        }
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        if !self.primed {
            self.prev = input[0];
            self.primed = true;
        }
        while self.pos < input.len() as f64 {
            let idx = self.pos.floor() as isize;
            let frac = (self.pos - self.pos.floor()) as f32;
            let a = if idx < 0 { self.prev } else { input[idx as usize] };
            let Some(&b) = input.get((idx + 1) as usize) else {
                break; // the window straddles the next chunk
            };
            out.push(a * (1.0 - frac) + b * frac);
            self.pos += self.step;
        }
        self.pos -= input.len() as f64;
        self.prev = *input.last().unwrap();
    }
}

fn run_live(model_spec: &str, options: RealtimeOptions, max_backlog_ms: u64) -> Result<()> {
    let dir = resolve_model(model_spec)?;
    let (model, tokenizer) = VoxtralModel::load(&dir)?;
    let mut session = RealtimeSession::new(model, tokenizer, &options)?;

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::FailedToReadAudio("no default input device".to_string()))?;
    let config = device
        .default_input_config()
        .map_err(|e| Error::FailedToReadAudio(format!("input config: {e}")))?;

    let device_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();

    eprintln!(
        "Capturing {} Hz x{} from {:?}; press Enter to stop.",
        device_rate,
        channels,
        device.name().unwrap_or_else(|_| "default".to_string())
    );

    let cap = (device_rate as u64 * max_backlog_ms / 1000) as usize;
    let queue = Arc::new(Mutex::new(MicQueue {
        samples: VecDeque::new(),
        cap: cap.max(1),
        dropped: 0,
    }));

    let err_fn = |err: cpal::StreamError| eprintln!("audio stream error: {err}");
    let stream = match sample_format {
        cpal::SampleFormat::F32 => {
            let queue = Arc::clone(&queue);
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _| {
                    let mut q = queue.lock().unwrap();
                    q.push(data.chunks(channels).map(|f| {
                        f.iter().sum::<f32>() / channels as f32
                    }));
                },
                err_fn,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let queue = Arc::clone(&queue);
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _| {
                    let mut q = queue.lock().unwrap();
                    q.push(data.chunks(channels).map(|f| {
                        f.iter().map(|&s| s as f32 / 32768.0).sum::<f32>() / channels as f32
                    }));
                },
                err_fn,
                None,
            )
        }
        other => {
            return Err(Error::UnsupportedAudioFormat(format!(
                "input sample format {other:?}"
            )))
        }
    }
    .map_err(|e| Error::FailedToReadAudio(format!("input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| Error::FailedToReadAudio(format!("input stream: {e}")))?;

    // Enter on stdin ends the stream.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            stop.store(true, Ordering::SeqCst);
        });
    }

    use std::io::Write as _;
    let mut resampler = LinearResampler::new(device_rate, voxtral_realtime_mlx::audio::SAMPLE_RATE);
    let mut captured = Vec::new();
    let mut resampled = Vec::new();
    let mut reported_drops = 0u64;

    while !stop.load(Ordering::SeqCst) {
        captured.clear();
        {
            let mut q = queue.lock().unwrap();
            captured.extend(q.samples.drain(..));
            if q.dropped > reported_drops {
                eprintln!("\n[dropped {} stale samples]", q.dropped - reported_drops);
                reported_drops = q.dropped;
            }
        }
        if captured.is_empty() {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        resampled.clear();
        resampler.process(&captured, &mut resampled);
        let fragment = session.append_audio_samples(&resampled)?;
        if !fragment.is_empty() {
            print!("{fragment}");
            std::io::stdout().flush().ok();
        }
    }

    drop(stream);
    let tail = session.finish_stream()?;
    println!("{tail}");
    Ok(())
}
