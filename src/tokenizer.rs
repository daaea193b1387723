//! Tekken tokenizer (`tekken.json`) decode support.
//!
//! The realtime pipeline only decodes: token ids map to raw byte pieces
//! which the session reassembles into UTF-8. Special tokens are looked up
//! by name; the audio section carries the streaming pad/delay metadata.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Number of special-token slots when `config.default_num_special_tokens`
/// is absent (Tekken convention).
const DEFAULT_NUM_SPECIAL_TOKENS: usize = 1000;

/// Audio metadata from the tokenizer file.
#[derive(Debug, Clone, Deserialize)]
pub struct TekkenAudioConfig {
    pub sampling_rate: u32,
    pub frame_rate: f32,
    pub transcription_delay_ms: usize,
    pub streaming_n_left_pad_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct TekkenFile {
    config: TekkenFileConfig,
    vocab: Vec<TekkenVocabEntry>,
    special_tokens: Vec<TekkenSpecialEntry>,
    #[serde(default)]
    audio: Option<TekkenAudioConfig>,
}

#[derive(Debug, Deserialize)]
struct TekkenFileConfig {
    num_vocab_tokens: usize,
    #[serde(default)]
    default_vocab_size: Option<usize>,
    #[serde(default)]
    default_num_special_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TekkenVocabEntry {
    rank: usize,
    #[serde(default)]
    token_bytes: Option<String>,
    #[serde(default)]
    token_str: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TekkenSpecialEntry {
    rank: usize,
    token_str: String,
    is_control: bool,
}

#[derive(Debug, Clone)]
struct SpecialToken {
    text: String,
    is_control: bool,
}

/// Byte-level Tekken tokenizer.
#[derive(Debug, Clone)]
pub struct TekkenTokenizer {
    vocab_size: usize,
    num_special_tokens: usize,
    token_bytes: Vec<Option<Vec<u8>>>,
    special_tokens: Vec<Option<SpecialToken>>,
    special_lookup: HashMap<String, u32>,
    audio: Option<TekkenAudioConfig>,
}

impl TekkenTokenizer {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: TekkenFile = serde_json::from_str(json)?;

        let num_special = file
            .config
            .default_num_special_tokens
            .unwrap_or(DEFAULT_NUM_SPECIAL_TOKENS);
        let vocab_size = file
            .config
            .default_vocab_size
            .unwrap_or(file.config.num_vocab_tokens + num_special);

        let mut special_tokens = vec![None; num_special];
        let mut special_lookup = HashMap::new();
        for entry in file.special_tokens {
            if entry.rank >= num_special {
                continue;
            }
            special_lookup.insert(entry.token_str.clone(), entry.rank as u32);
            special_tokens[entry.rank] = Some(SpecialToken {
                text: entry.token_str,
                is_control: entry.is_control,
            });
        }

        let mut token_bytes = vec![None; vocab_size.saturating_sub(num_special)];
        for entry in file.vocab {
            if entry.rank >= token_bytes.len() {
                continue;
            }
            let bytes = match (&entry.token_bytes, &entry.token_str) {
                (Some(b64), _) => BASE64.decode(b64.as_bytes()).map_err(|e| {
                    Error::UnsupportedModelFormat(format!(
                        "bad base64 for vocab rank {}: {e}",
                        entry.rank
                    ))
                })?,
                (None, Some(s)) => s.as_bytes().to_vec(),
                (None, None) => continue,
            };
            token_bytes[entry.rank] = Some(bytes);
        }

        Ok(Self {
            vocab_size,
            num_special_tokens: num_special,
            token_bytes,
            special_tokens,
            special_lookup,
            audio: file.audio,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.display().to_string()));
        }
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn num_special_tokens(&self) -> usize {
        self.num_special_tokens
    }

    /// Look up a special token id by its literal text, e.g. `"<s>"`.
    pub fn special_token_id(&self, name: &str) -> Option<u32> {
        self.special_lookup.get(name).copied()
    }

    pub fn bos_id(&self) -> Option<u32> {
        self.special_token_id("<s>")
    }

    pub fn eos_id(&self) -> Option<u32> {
        self.special_token_id("</s>")
    }

    pub fn streaming_pad_id(&self) -> Option<u32> {
        self.special_token_id("[STREAMING_PAD]")
    }

    pub fn audio(&self) -> Option<&TekkenAudioConfig> {
        self.audio.as_ref()
    }

    /// Raw bytes for a token id.
    ///
    /// Control special tokens always decode to empty bytes; with
    /// `ignore_special_tokens` every special token does.
    pub fn decoded_bytes(&self, token_id: u32, ignore_special_tokens: bool) -> &[u8] {
        let idx = token_id as usize;
        if idx >= self.vocab_size {
            return &[];
        }
        if idx < self.num_special_tokens {
            if ignore_special_tokens {
                return &[];
            }
            return match &self.special_tokens[idx] {
                Some(st) if !st.is_control => st.text.as_bytes(),
                _ => &[],
            };
        }
        match &self.token_bytes[idx - self.num_special_tokens] {
            Some(bytes) => bytes,
            None => &[],
        }
    }

    /// Decode a whole id sequence to text, replacing invalid UTF-8.
    pub fn decode_lossy(&self, token_ids: &[u32], ignore_special_tokens: bool) -> String {
        let mut bytes = Vec::new();
        for &id in token_ids {
            bytes.extend_from_slice(self.decoded_bytes(id, ignore_special_tokens));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const MINI_TEKKEN: &str = r#"
    {
      "config": {
        "num_vocab_tokens": 12,
        "default_vocab_size": 16,
        "default_num_special_tokens": 4
      },
      "special_tokens": [
        {"rank": 0, "token_str": "<unk>", "is_control": true},
        {"rank": 1, "token_str": "<s>", "is_control": true},
        {"rank": 2, "token_str": "</s>", "is_control": true},
        {"rank": 3, "token_str": "[STREAMING_PAD]", "is_control": true}
      ],
      "vocab": [
        {"rank": 0, "token_bytes": "QQ=="},
        {"rank": 1, "token_bytes": "Qg=="},
        {"rank": 2, "token_str": "C"}
      ],
      "audio": {
        "sampling_rate": 16000,
        "frame_rate": 12.5,
        "transcription_delay_ms": 480,
        "streaming_n_left_pad_tokens": 32
      }
    }
    "#;

    #[test]
    fn decodes_mixed_control_and_text_tokens() {
        let t = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        assert_eq!(t.bos_id(), Some(1));
        assert_eq!(t.eos_id(), Some(2));
        assert_eq!(t.special_token_id("[STREAMING_PAD]"), Some(3));

        // Specials decode empty; id 4 is vocab rank 0 ("A").
        assert_eq!(t.decode_lossy(&[1, 4, 1, 2, 2], true), "A");
        assert_eq!(t.decode_lossy(&[4, 5, 6], true), "ABC");
    }

    #[test]
    fn audio_metadata_round_trip() {
        let t = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        let audio = t.audio().unwrap();
        assert_eq!(audio.streaming_n_left_pad_tokens, 32);
        assert_eq!(audio.transcription_delay_ms, 480);
        assert_eq!(audio.frame_rate, 12.5);
    }

    #[test]
    fn out_of_range_ids_decode_empty() {
        let t = TekkenTokenizer::from_json_str(MINI_TEKKEN).unwrap();
        assert!(t.decoded_bytes(15, true).is_empty()); // unfilled vocab slot
        assert!(t.decoded_bytes(99, true).is_empty()); // past vocab_size
    }
}
