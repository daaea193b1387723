//! Realtime streaming session.
//!
//! Audio arrives in arbitrary chunks; the session consumes whole 80 ms
//! token multiples through the mel frontend and incremental encoder,
//! prefills the decoder once enough audio embeddings exist, then decodes
//! one position per embedding row. Streaming decode respects the
//! transcription-delay look-ahead; `finish_stream` drains everything.

use std::collections::VecDeque;

use mlx_rs::ops;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;

use crate::audio::log_mel_step;
use crate::cache::RotatingKvCache;
use crate::decoder::{sample, time_embedding};
use crate::encoder::EncoderStreamState;
use crate::error::{Error, Result};
use crate::model::VoxtralModel;
use crate::tokenizer::TekkenTokenizer;
use crate::transcribe::{DEFAULT_DELAY_MS, DEFAULT_LEFT_PAD_TOKENS};

/// Token duration at the decoder frame rate.
const TOKEN_MS: f32 = 80.0;
/// Consumed-prefix size that triggers pending-PCM compaction.
const COMPACT_BYTES: usize = 32 * 1024;

/// Decode scheduling at the step boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Respect the audio look-ahead lower bound.
    Streaming,
    /// Finalization: decode every available embedding row.
    DrainAll,
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    /// Softmax temperature; `<= 0` decodes greedily.
    pub temperature: f32,
    /// Audio chunk consumed per pipeline step, rounded to whole tokens.
    pub chunk_duration_ms: i64,
    /// Override for the tokenizer's transcription delay.
    pub transcription_delay_ms: Option<usize>,
    /// Silence tokens appended by `finish_stream`.
    pub right_pad_tokens: usize,
    /// Decoder KV window override; never below 256.
    pub decoder_window_tokens: Option<i32>,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            chunk_duration_ms: 80,
            transcription_delay_ms: None,
            right_pad_tokens: 17,
            decoder_window_tokens: None,
        }
    }
}

/// Chunk size in whole audio tokens, at least one.
fn chunk_tokens(chunk_duration_ms: i64) -> Result<usize> {
    if chunk_duration_ms <= 0 {
        return Err(Error::InvalidChunkDuration(chunk_duration_ms));
    }
    Ok((((chunk_duration_ms as f32) / TOKEN_MS).round() as usize).max(1))
}

/// Highest decoder position allowed by the audio fed so far.
fn max_decoded_positions(left_pad_tokens: usize, samples_fed: usize, samples_per_token: usize) -> usize {
    left_pad_tokens + samples_fed / samples_per_token
}

/// Drain the longest valid UTF-8 prefix from `pending`.
///
/// An incomplete trailing sequence stays queued; hard-invalid bytes are
/// replaced so the queue cannot wedge mid-stream.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&pending[..valid]).unwrap_or(""));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        break;
                    }
                }
            }
        }
    }
    out
}

fn should_compact(cursor: usize, queue_len: usize) -> bool {
    cursor > COMPACT_BYTES && cursor * 2 >= queue_len
}

/// Stateful streaming transcription session.
pub struct RealtimeSession {
    model: VoxtralModel,
    tokenizer: TekkenTokenizer,

    temperature: f32,
    chunk_samples: usize,
    samples_per_token: usize,
    left_pad_tokens: usize,
    right_pad_tokens: usize,
    decoder_window: i32,
    log_mel_max: f32,
    eos_id: u32,

    prefix_len: usize,
    prefix_embeds: Array,
    ada_scales: Vec<Array>,

    pcm: Vec<f32>,
    pcm_cursor: usize,
    mel_tail: Option<Vec<f32>>,
    enc_state: EncoderStreamState,
    audio_embeds: VecDeque<Array>,
    caches: Vec<RotatingKvCache>,
    pending_bytes: Vec<u8>,

    total_audio_samples_fed: usize,
    total_decoded_positions: usize,
    first_cycle: bool,
    prefilled: bool,
    current_token: i32,
}

impl RealtimeSession {
    pub fn new(
        mut model: VoxtralModel,
        tokenizer: TekkenTokenizer,
        options: &RealtimeOptions,
    ) -> Result<Self> {
        let bos_id = tokenizer
            .bos_id()
            .ok_or_else(|| Error::MissingSpecialToken("<s>".to_string()))?;
        let eos_id = tokenizer
            .eos_id()
            .ok_or_else(|| Error::MissingSpecialToken("</s>".to_string()))?;
        let pad_id = tokenizer
            .streaming_pad_id()
            .ok_or_else(|| Error::MissingSpecialToken("[STREAMING_PAD]".to_string()))?;

        let samples_per_token = model.config.samples_per_token();
        let chunk_samples = chunk_tokens(options.chunk_duration_ms)? * samples_per_token;

        let left_pad_tokens = tokenizer
            .audio()
            .map(|a| a.streaming_n_left_pad_tokens)
            .unwrap_or(DEFAULT_LEFT_PAD_TOKENS);
        let delay_ms = options
            .transcription_delay_ms
            .or_else(|| tokenizer.audio().map(|a| a.transcription_delay_ms))
            .unwrap_or(DEFAULT_DELAY_MS);
        let delay_tokens = model.config.delay_tokens(delay_ms);

        let decoder_window = options
            .decoder_window_tokens
            .unwrap_or_else(|| model.decoder_window())
            .max(256);

        let log_mel_max = model.config.audio_encoding().global_log_mel_max;

        // Immutable prefix state for the session lifetime.
        let mut prefix_ids: Vec<i32> = Vec::with_capacity(1 + left_pad_tokens + delay_tokens);
        prefix_ids.push(bos_id as i32);
        prefix_ids.extend(std::iter::repeat(pad_id as i32).take(left_pad_tokens + delay_tokens));
        let prefix_len = prefix_ids.len();
        let id_array = Array::from_slice(&prefix_ids, &[1, prefix_len as i32]);
        let prefix_embeds = model.decoder.embed(&id_array)?;

        let t_cond = time_embedding(delay_tokens as f32, model.config.dim);
        let ada_scales = model.decoder.ada_scales(&t_cond)?;

        let enc_state = model.encoder.stream_state();
        let caches = model.decoder.caches(decoder_window);

        Ok(Self {
            model,
            tokenizer,
            temperature: options.temperature,
            chunk_samples,
            samples_per_token,
            left_pad_tokens,
            right_pad_tokens: options.right_pad_tokens,
            decoder_window,
            log_mel_max,
            eos_id,
            prefix_len,
            prefix_embeds,
            ada_scales,
            pcm: Vec::new(),
            pcm_cursor: 0,
            mel_tail: None,
            enc_state,
            audio_embeds: VecDeque::new(),
            caches,
            pending_bytes: Vec::new(),
            total_audio_samples_fed: 0,
            total_decoded_positions: 0,
            first_cycle: true,
            prefilled: false,
            current_token: 0,
        })
    }

    /// Samples consumed per pipeline step.
    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Append raw PCM and return any newly decodable text.
    ///
    /// Returns an empty string while buffers fill or the look-ahead guard
    /// is unsatisfied; that is normal streaming behavior, not an error.
    pub fn append_audio_samples(&mut self, samples: &[f32]) -> Result<String> {
        self.pcm.extend_from_slice(samples);

        while self.pcm.len() - self.pcm_cursor >= self.chunk_samples {
            let chunk: Vec<f32> =
                self.pcm[self.pcm_cursor..self.pcm_cursor + self.chunk_samples].to_vec();
            self.pcm_cursor += self.chunk_samples;
            if should_compact(self.pcm_cursor, self.pcm.len()) {
                self.pcm.drain(..self.pcm_cursor);
                self.pcm_cursor = 0;
            }
            let consumed = chunk.len();
            self.feed_pcm(&chunk, consumed)?;
        }

        let mut out = String::new();
        self.decode_available(DecodeMode::Streaming, &mut out)?;
        Ok(out)
    }

    /// Flush the stream: trailing silence, drain-all decode, final token.
    pub fn finish_stream(&mut self) -> Result<String> {
        let right_pad = self.right_pad_tokens * self.samples_per_token;
        self.pcm
            .extend(std::iter::repeat(0.0f32).take(right_pad));

        let remaining: Vec<f32> = self.pcm[self.pcm_cursor..].to_vec();
        self.pcm.clear();
        self.pcm_cursor = 0;

        let mut out = String::new();
        if !remaining.is_empty() {
            let non_pad = remaining.len().saturating_sub(right_pad);
            self.feed_pcm(&remaining, non_pad)?;
        }
        self.decode_available(DecodeMode::DrainAll, &mut out)?;

        // The most recent sampled token was never fed back; emit it now.
        if self.prefilled && self.current_token != self.eos_id as i32 {
            let id = self.current_token as u32;
            self.push_token(id, &mut out);
        }
        if !self.pending_bytes.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending_bytes));
        }
        self.reset();
        Ok(out)
    }

    /// Run one PCM batch through mel + encoder, banking embedding rows.
    fn feed_pcm(&mut self, chunk: &[f32], non_pad_samples: usize) -> Result<()> {
        let mut first_chunk;
        let fed: &[f32] = if self.first_cycle {
            first_chunk = vec![0.0f32; self.left_pad_tokens * self.samples_per_token];
            first_chunk.extend_from_slice(chunk);
            self.first_cycle = false;
            &first_chunk
        } else {
            chunk
        };

        let (mel, tail) = log_mel_step(fed, self.mel_tail.as_deref(), self.log_mel_max)?;
        self.mel_tail = Some(tail);

        if let Some(embeds) = self.model.encode_step(&mel, &mut self.enc_state)? {
            for i in 0..embeds.dim(0) {
                let row = embeds.index((i..i + 1, ..)).expand_dims(0)?;
                self.audio_embeds.push_back(row);
            }
        }
        self.total_audio_samples_fed += non_pad_samples;
        Ok(())
    }

    fn decode_available(&mut self, mode: DecodeMode, out: &mut String) -> Result<()> {
        if !self.prefilled {
            if self.audio_embeds.len() < self.prefix_len {
                return Ok(());
            }
            let rows: Vec<Array> = (0..self.prefix_len)
                .map(|_| self.audio_embeds.pop_front().unwrap())
                .collect();
            let refs: Vec<&Array> = rows.iter().collect();
            let audio = ops::concatenate_axis(&refs, 1)?;
            let h = self.prefix_embeds.add(&audio)?;

            let hidden = self.model.decoder.forward_embeddings(
                &h,
                &mut self.caches,
                true,
                Some(&self.ada_scales),
            )?;
            let last = hidden.index((.., -1, ..));
            let logits = self.model.decoder.logits(&last)?;
            self.current_token = sample(&logits, self.temperature)?;
            self.prefilled = true;
            self.total_decoded_positions = self.prefix_len;

            if self.current_token == self.eos_id as i32 {
                self.finish_transcript(out);
                return Ok(());
            }
        }

        loop {
            if self.audio_embeds.is_empty() {
                break;
            }
            if mode == DecodeMode::Streaming
                && self.total_decoded_positions
                    >= max_decoded_positions(
                        self.left_pad_tokens,
                        self.total_audio_samples_fed,
                        self.samples_per_token,
                    )
            {
                break;
            }

            let row = self.audio_embeds.pop_front().unwrap();
            let fed_token = self.current_token;
            let id_array = Array::from_slice(&[fed_token], &[1, 1]);
            let h = self.model.decoder.embed(&id_array)?.add(&row)?;

            let hidden = self.model.decoder.forward_embeddings(
                &h,
                &mut self.caches,
                false,
                Some(&self.ada_scales),
            )?;
            let logits = self.model.decoder.logits(&hidden)?;
            let next = sample(&logits, self.temperature)?;
            self.total_decoded_positions += 1;

            // The fed token is now confirmed; its bytes become emittable.
            self.push_token(fed_token as u32, out);

            if next == self.eos_id as i32 {
                self.finish_transcript(out);
                return Ok(());
            }
            self.current_token = next;
        }
        Ok(())
    }

    fn push_token(&mut self, token_id: u32, out: &mut String) {
        self.pending_bytes
            .extend_from_slice(self.tokenizer.decoded_bytes(token_id, true));
        out.push_str(&take_utf8_prefix(&mut self.pending_bytes));
    }

    /// EOS boundary: flush, newline, and a full state reset so the next
    /// audio starts a fresh transcript.
    fn finish_transcript(&mut self, out: &mut String) {
        if !self.pending_bytes.is_empty() {
            out.push_str(&String::from_utf8_lossy(&self.pending_bytes));
        }
        out.push('\n');
        self.reset();
    }

    fn reset(&mut self) {
        self.mel_tail = None;
        self.enc_state = self.model.encoder.stream_state();
        self.audio_embeds.clear();
        self.caches = self.model.decoder.caches(self.decoder_window);
        self.pending_bytes.clear();
        self.total_audio_samples_fed = 0;
        self.total_decoded_positions = 0;
        self.first_cycle = true;
        self.prefilled = false;
        self.current_token = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_round_to_whole_tokens() {
        assert_eq!(chunk_tokens(80).unwrap(), 1);
        assert_eq!(chunk_tokens(160).unwrap(), 2);
        assert_eq!(chunk_tokens(40).unwrap(), 1);
        assert_eq!(chunk_tokens(10).unwrap(), 1);
        assert_eq!(chunk_tokens(200).unwrap(), 3);
        assert!(matches!(
            chunk_tokens(0),
            Err(Error::InvalidChunkDuration(0))
        ));
        assert!(matches!(
            chunk_tokens(-5),
            Err(Error::InvalidChunkDuration(-5))
        ));
    }

    #[test]
    fn look_ahead_guard_tracks_fed_audio() {
        // No audio fed: only the left-pad positions are coverable.
        assert_eq!(max_decoded_positions(32, 0, 1280), 32);
        // Partial tokens do not unlock positions.
        assert_eq!(max_decoded_positions(32, 1279, 1280), 32);
        assert_eq!(max_decoded_positions(32, 1280, 1280), 33);
        assert_eq!(max_decoded_positions(32, 5 * 1280 + 7, 1280), 37);
    }

    #[test]
    fn utf8_prefix_carries_split_multibyte() {
        let mut pending = Vec::new();

        pending.extend_from_slice(&[0xC3]); // first half of 'é'
        assert_eq!(take_utf8_prefix(&mut pending), "");
        assert_eq!(pending, vec![0xC3]);

        pending.push(0xA9);
        assert_eq!(take_utf8_prefix(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn utf8_prefix_replaces_hard_invalid_bytes() {
        let mut pending = b"ok".to_vec();
        pending.push(0xFF);
        pending.extend_from_slice("là".as_bytes());
        assert_eq!(take_utf8_prefix(&mut pending), "ok\u{FFFD}là");
        assert!(pending.is_empty());
    }

    #[test]
    fn compaction_waits_for_large_consumed_prefix() {
        assert!(!should_compact(1024, 4096));
        assert!(!should_compact(40_000, 100_000));
        assert!(should_compact(40_000, 60_000));
        assert!(should_compact(33_000, 33_000));
    }
}
