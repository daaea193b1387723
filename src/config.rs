//! Model hyperparameters.
//!
//! A Voxtral model directory carries its hyperparameters either as
//! `params.json` (original Mistral checkpoint) or `config.json` (converted
//! checkpoint). Both use the same snake_case key tree.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Audio frontend geometry, nested under the encoder arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioEncodingConfig {
    pub sampling_rate: u32,
    pub frame_rate: f32,
    pub num_mel_bins: i32,
    pub hop_length: i32,
    pub window_size: i32,
    pub global_log_mel_max: f32,
}

/// Whisper-style audio encoder hyperparameters.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub audio_encoding_args: AudioEncodingConfig,
    pub dim: i32,
    pub n_layers: i32,
    pub head_dim: i32,
    pub hidden_dim: i32,
    pub n_heads: i32,
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
    pub sliding_window: i32,
}

/// Adaptor hyperparameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DownsampleConfig {
    pub downsample_factor: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperModelConfig {
    pub encoder_args: EncoderConfig,
    pub downsample_args: DownsampleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultimodalConfig {
    pub whisper_model_args: WhisperModelConfig,
}

/// Quantization metadata found in converted checkpoints.
///
/// Quantized weights are not supported by this crate; the field is parsed
/// only so the loader can reject them with a clear error.
#[derive(Debug, Clone, Deserialize)]
pub struct QuantizationConfig {
    pub group_size: i32,
    pub bits: i32,
}

/// Full Voxtral model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VoxtralConfig {
    pub dim: i32,
    pub n_layers: i32,
    pub head_dim: i32,
    pub hidden_dim: i32,
    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub rope_theta: f32,
    pub norm_eps: f32,
    pub vocab_size: i32,
    pub sliding_window: i32,
    #[serde(default = "default_t_cond_dim")]
    pub ada_rms_norm_t_cond_dim: i32,
    pub multimodal: MultimodalConfig,
    #[serde(default)]
    pub quantization: Option<QuantizationConfig>,
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_t_cond_dim() -> i32 {
    32
}

/// Which on-disk checkpoint layout a model directory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// `params.json` + raw `*.safetensors` with Mistral tensor names
    Original,
    /// `config.json` + `model*.safetensors` with this crate's tensor names
    Converted,
}

impl VoxtralConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::MissingFile(path.display().to_string()));
        }
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Detect the checkpoint format in `dir` and load its configuration.
    pub fn detect(dir: impl AsRef<Path>) -> Result<(ModelFormat, Self)> {
        let dir = dir.as_ref();
        let params = dir.join("params.json");
        let config = dir.join("config.json");

        if params.exists() {
            return Ok((ModelFormat::Original, Self::from_path(&params)?));
        }
        if config.exists() {
            let parsed = Self::from_path(&config)?;
            if parsed.quantization.is_some() {
                return Err(Error::UnsupportedModelFormat(
                    "quantized checkpoints are not supported".to_string(),
                ));
            }
            return Ok((ModelFormat::Converted, parsed));
        }
        Err(Error::UnsupportedModelFormat(format!(
            "no params.json or config.json in {}",
            dir.display()
        )))
    }

    pub fn encoder(&self) -> &EncoderConfig {
        &self.multimodal.whisper_model_args.encoder_args
    }

    pub fn audio_encoding(&self) -> &AudioEncodingConfig {
        &self.encoder().audio_encoding_args
    }

    pub fn downsample_factor(&self) -> i32 {
        self.multimodal.whisper_model_args.downsample_args.downsample_factor
    }

    /// Raw PCM samples per decoder position.
    ///
    /// hop (mel) x 2 (conv2 stride) x downsample_factor; 1280 = 80 ms at
    /// 16 kHz for the stock geometry.
    pub fn samples_per_token(&self) -> usize {
        (self.audio_encoding().hop_length as usize) * 2 * (self.downsample_factor() as usize)
    }

    /// Convert a transcription delay in milliseconds to decoder positions.
    pub fn delay_tokens(&self, delay_ms: usize) -> usize {
        let frame_rate = self.audio_encoding().frame_rate;
        ((delay_ms as f32) / 1000.0 * frame_rate).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const PARAMS_FIXTURE: &str = r#"
    {
      "dim": 3072,
      "n_layers": 26,
      "head_dim": 128,
      "hidden_dim": 9216,
      "n_heads": 32,
      "n_kv_heads": 8,
      "rope_theta": 1000000.0,
      "norm_eps": 1e-05,
      "vocab_size": 131072,
      "sliding_window": 8192,
      "ada_rms_norm_t_cond_dim": 32,
      "multimodal": {
        "whisper_model_args": {
          "encoder_args": {
            "audio_encoding_args": {
              "sampling_rate": 16000,
              "frame_rate": 12.5,
              "num_mel_bins": 128,
              "hop_length": 160,
              "window_size": 400,
              "global_log_mel_max": 1.5
            },
            "dim": 1280,
            "n_layers": 32,
            "head_dim": 64,
            "hidden_dim": 5120,
            "n_heads": 32,
            "rope_theta": 1000000.0,
            "norm_eps": 1e-05,
            "sliding_window": 750
          },
          "downsample_args": { "downsample_factor": 4 }
        }
      }
    }
    "#;

    #[test]
    fn parses_params_fixture() {
        let cfg = VoxtralConfig::from_json_str(PARAMS_FIXTURE).unwrap();
        assert_eq!(cfg.dim, 3072);
        assert_eq!(cfg.encoder().dim, 1280);
        assert_eq!(cfg.audio_encoding().num_mel_bins, 128);
        assert_eq!(cfg.downsample_factor(), 4);
        assert_eq!(cfg.samples_per_token(), 1280);
        assert_eq!(cfg.delay_tokens(480), 6);
    }

    #[test]
    fn detects_format_and_rejects_quantized() {
        let dir = std::env::temp_dir().join(format!(
            "voxtral-config-test-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(dir.join("params.json"), PARAMS_FIXTURE).unwrap();
        let (format, _) = VoxtralConfig::detect(&dir).unwrap();
        assert_eq!(format, ModelFormat::Original);
        std::fs::remove_file(dir.join("params.json")).unwrap();

        let mut value: serde_json::Value = serde_json::from_str(PARAMS_FIXTURE).unwrap();
        value["quantization"] = serde_json::json!({ "group_size": 64, "bits": 4 });
        std::fs::write(dir.join("config.json"), value.to_string()).unwrap();
        assert!(matches!(
            VoxtralConfig::detect(&dir),
            Err(Error::UnsupportedModelFormat(_))
        ));

        std::fs::write(dir.join("config.json"), PARAMS_FIXTURE).unwrap();
        let (format, _) = VoxtralConfig::detect(&dir).unwrap();
        assert_eq!(format, ModelFormat::Converted);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_is_unsupported() {
        let dir = std::env::temp_dir().join("voxtral-config-test-empty");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            VoxtralConfig::detect(&dir),
            Err(Error::UnsupportedModelFormat(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
