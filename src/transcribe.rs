//! Offline (whole-clip) transcription pipeline.
//!
//! Pad the clip with the streaming silence prefix/suffix, run the mel
//! frontend and encoder once, prefill the decoder over the prompt
//! positions, then decode one token per remaining audio embedding row.

use std::time::Instant;

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;

use crate::audio::{load_audio, log_mel_offline, SAMPLES_PER_TOKEN, SAMPLE_RATE};
use crate::decoder::{sample, time_embedding};
use crate::error::{Error, Result};
use crate::model::VoxtralModel;
use crate::tokenizer::TekkenTokenizer;

/// Extra flush tokens appended after the transcription delay at clip end.
const EOS_EXTRA_TOKENS: usize = 10;

/// Fallback transcription delay when the tokenizer carries no metadata.
pub(crate) const DEFAULT_DELAY_MS: usize = 480;
/// Fallback silence prefix when the tokenizer carries no metadata.
pub(crate) const DEFAULT_LEFT_PAD_TOKENS: usize = 32;

#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    /// Softmax temperature; `<= 0` decodes greedily.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_new_tokens: usize,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_new_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionStats {
    pub audio_secs: f64,
    pub encode_ms: f64,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub generated_tokens: usize,
}

impl TranscriptionStats {
    /// Processing time over audio time; below 1.0 is faster than realtime.
    pub fn real_time_factor(&self) -> f64 {
        if self.audio_secs <= 0.0 {
            return 0.0;
        }
        (self.encode_ms + self.prefill_ms + self.decode_ms) / 1000.0 / self.audio_secs
    }
}

#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub stats: TranscriptionStats,
}

/// One-shot transcriber owning the model and tokenizer.
pub struct Transcriber {
    model: VoxtralModel,
    tokenizer: TekkenTokenizer,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
    left_pad_tokens: usize,
    delay_tokens: usize,
}

impl Transcriber {
    pub fn new(model: VoxtralModel, tokenizer: TekkenTokenizer) -> Result<Self> {
        let bos_id = tokenizer
            .bos_id()
            .ok_or_else(|| Error::MissingSpecialToken("<s>".to_string()))?;
        let eos_id = tokenizer
            .eos_id()
            .ok_or_else(|| Error::MissingSpecialToken("</s>".to_string()))?;
        let pad_id = tokenizer
            .streaming_pad_id()
            .ok_or_else(|| Error::MissingSpecialToken("[STREAMING_PAD]".to_string()))?;

        let left_pad_tokens = tokenizer
            .audio()
            .map(|a| a.streaming_n_left_pad_tokens)
            .unwrap_or(DEFAULT_LEFT_PAD_TOKENS);
        let delay_ms = tokenizer
            .audio()
            .map(|a| a.transcription_delay_ms)
            .unwrap_or(DEFAULT_DELAY_MS);
        let delay_tokens = model.config.delay_tokens(delay_ms);

        Ok(Self {
            model,
            tokenizer,
            bos_id,
            eos_id,
            pad_id,
            left_pad_tokens,
            delay_tokens,
        })
    }

    pub fn into_parts(self) -> (VoxtralModel, TekkenTokenizer) {
        (self.model, self.tokenizer)
    }

    fn prompt_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(1 + self.left_pad_tokens + self.delay_tokens);
        ids.push(self.bos_id);
        ids.extend(std::iter::repeat(self.pad_id).take(self.left_pad_tokens + self.delay_tokens));
        ids
    }

    pub fn transcribe_file(
        &mut self,
        path: impl AsRef<std::path::Path>,
        options: &TranscribeOptions,
    ) -> Result<Transcription> {
        let samples = load_audio(path)?;
        self.transcribe(&samples, options)
    }

    /// Transcribe 16 kHz mono samples.
    pub fn transcribe(
        &mut self,
        samples: &[f32],
        options: &TranscribeOptions,
    ) -> Result<Transcription> {
        let prompt = self.prompt_ids();
        let prefix_len = prompt.len();
        let right_pad_tokens = self.delay_tokens + 1 + EOS_EXTRA_TOKENS;

        // Silence prefix, alignment to a whole token, then the flush tail.
        let mut padded =
            Vec::with_capacity(samples.len() + (self.left_pad_tokens + right_pad_tokens + 1) * SAMPLES_PER_TOKEN);
        padded.resize(self.left_pad_tokens * SAMPLES_PER_TOKEN, 0.0);
        padded.extend_from_slice(samples);
        let rem = padded.len() % SAMPLES_PER_TOKEN;
        if rem != 0 {
            padded.resize(padded.len() + SAMPLES_PER_TOKEN - rem, 0.0);
        }
        padded.resize(padded.len() + right_pad_tokens * SAMPLES_PER_TOKEN, 0.0);

        let encode_start = Instant::now();
        let log_mel_max = self.model.config.audio_encoding().global_log_mel_max;
        let mel = log_mel_offline(&padded, log_mel_max)?;
        let audio_embeds = self.model.encode(&mel)?;
        let available = audio_embeds.dim(0) as usize;
        if available < prefix_len {
            return Err(Error::AudioTooShortForPrompt {
                required: prefix_len,
                available,
            });
        }
        let encode_ms = encode_start.elapsed().as_secs_f64() * 1000.0;

        // Prompt embeddings + the first `prefix_len` audio rows.
        let ids: Vec<i32> = prompt.iter().map(|&id| id as i32).collect();
        let id_array = Array::from_slice(&ids, &[1, prefix_len as i32]);
        let prompt_embeds = self.model.decoder.embed(&id_array)?;
        let audio_prefix = audio_embeds
            .index((..(prefix_len as i32), ..))
            .expand_dims(0)?;
        let h = prompt_embeds.add(&audio_prefix)?;

        let t_cond = time_embedding(self.delay_tokens as f32, self.model.config.dim);
        let ada_scales = self.model.decoder.ada_scales(&t_cond)?;
        let mut caches = self.model.decoder.caches(self.model.decoder_window());

        let prefill_start = Instant::now();
        let hidden = self
            .model
            .decoder
            .forward_embeddings(&h, &mut caches, true, Some(&ada_scales))?;
        let last = hidden.index((.., -1, ..));
        let logits = self.model.decoder.logits(&last)?;
        let mut current = sample(&logits, options.temperature)?;
        let prefill_ms = prefill_start.elapsed().as_secs_f64() * 1000.0;

        // One token per remaining audio row, plus the prefill token.
        let budget = options
            .max_new_tokens
            .min(available - prefix_len + 1);

        let decode_start = Instant::now();
        let mut tokens: Vec<u32> = Vec::new();
        while current != self.eos_id as i32 && tokens.len() < budget {
            tokens.push(current as u32);
            if tokens.len() >= budget {
                break;
            }

            let row_idx = (prefix_len - 1 + tokens.len()) as i32;
            let id_array = Array::from_slice(&[current], &[1, 1]);
            let row = audio_embeds
                .index((row_idx..row_idx + 1, ..))
                .expand_dims(0)?;
            let h = self.model.decoder.embed(&id_array)?.add(&row)?;

            let hidden = self
                .model
                .decoder
                .forward_embeddings(&h, &mut caches, false, Some(&ada_scales))?;
            let logits = self.model.decoder.logits(&hidden)?;
            current = sample(&logits, options.temperature)?;
        }
        let decode_ms = decode_start.elapsed().as_secs_f64() * 1000.0;

        let text = self
            .tokenizer
            .decode_lossy(&tokens, true)
            .trim()
            .to_string();

        Ok(Transcription {
            text,
            stats: TranscriptionStats {
                audio_secs: samples.len() as f64 / SAMPLE_RATE as f64,
                encode_ms,
                prefill_ms,
                decode_ms,
                generated_tokens: tokens.len(),
            },
        })
    }
}
