//! # Voxtral Realtime MLX
//!
//! Streaming speech-to-text for Voxtral-family models: a Whisper-style
//! audio encoder feeding a sliding-window causal decoder with
//! time-conditioned adaptive normalization, running on MLX.
//!
//! ## Pipeline
//!
//! ```text
//! PCM (16 kHz)
//!     → incremental log-mel (128 bins)
//!     → streaming encoder (causal convs + transformer, rotating KV)
//!     → downsample adaptor (4 frames → 1 decoder position, 80 ms)
//!     → decoder LM (GQA + SwiGLU + adaptive RMS norm, rotating KV)
//!     → byte-level Tekken decode → UTF-8 text fragments
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use voxtral_realtime_mlx::{
//!     resolve_model, RealtimeOptions, RealtimeSession, VoxtralModel,
//! };
//!
//! let dir = resolve_model("mistralai/Voxtral-Mini-3B-Realtime-2602")?;
//! let (model, tokenizer) = VoxtralModel::load(&dir)?;
//! let mut session = RealtimeSession::new(model, tokenizer, &RealtimeOptions::default())?;
//!
//! for chunk in microphone_chunks() {
//!     print!("{}", session.append_audio_samples(&chunk)?);
//! }
//! println!("{}", session.finish_stream()?);
//! ```

pub mod adaptor;
pub mod audio;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod model;
pub mod stream;
pub mod tokenizer;
pub mod transcribe;
pub mod weights;

pub use cache::{KeyValueCache, RotatingKvCache};
pub use config::{ModelFormat, VoxtralConfig};
pub use error::{Error, Result};
pub use model::{resolve_model, VoxtralModel};
pub use stream::{DecodeMode, RealtimeOptions, RealtimeSession};
pub use tokenizer::TekkenTokenizer;
pub use transcribe::{TranscribeOptions, Transcriber, Transcription};
