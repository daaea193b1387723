//! Model assembly and directory/hub resolution.

use std::path::{Path, PathBuf};

use mlx_rs::macros::ModuleParameters;
use mlx_rs::Array;

use crate::adaptor::DownsampleAdaptor;
use crate::config::{ModelFormat, VoxtralConfig};
use crate::decoder::LanguageModel;
use crate::encoder::{AudioEncoder, EncoderStreamState};
use crate::error::{Error, Result};
use crate::tokenizer::TekkenTokenizer;
use crate::weights;

/// The full Voxtral stack: audio encoder, downsample adaptor, decoder LM.
#[derive(Debug, ModuleParameters)]
pub struct VoxtralModel {
    #[param]
    pub encoder: AudioEncoder,
    #[param]
    pub adaptor: DownsampleAdaptor,
    #[param]
    pub decoder: LanguageModel,

    pub config: VoxtralConfig,
}

impl VoxtralModel {
    /// Build an uninitialized model from hyperparameters.
    pub fn new(config: VoxtralConfig) -> Result<Self> {
        let encoder_cfg = config.encoder().clone();
        let k = config.downsample_factor();
        let encoder = AudioEncoder::new(encoder_cfg, k)?;
        let adaptor = DownsampleAdaptor::new(k * config.encoder().dim, config.dim)?;
        let decoder = LanguageModel::new(&config)?;
        Ok(Self {
            encoder,
            adaptor,
            decoder,
            config,
        })
    }

    /// Load model and tokenizer from a model directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<(Self, TekkenTokenizer)> {
        let dir = dir.as_ref();

        let tekken = dir.join("tekken.json");
        if !tekken.exists() {
            return Err(Error::MissingFile(tekken.display().to_string()));
        }
        let tokenizer = TekkenTokenizer::from_path(&tekken)?;

        let (format, config) = VoxtralConfig::detect(dir)?;
        eprintln!(
            "Loading Voxtral ({} format) from {}...",
            match format {
                ModelFormat::Original => "original",
                ModelFormat::Converted => "converted",
            },
            dir.display()
        );

        let mut model = Self::new(config)?;
        weights::load_weights(&mut model, dir, format)?;
        Ok((model, tokenizer))
    }

    /// Offline encode of a mel spectrogram `(n_mels, frames)` into audio
    /// embeddings `(rows, dim)`.
    pub fn encode(&mut self, mel: &Array) -> Result<Array> {
        self.encoder.encode(mel, &mut self.adaptor)
    }

    /// Incremental encode step; `None` until a full downsample group exists.
    pub fn encode_step(
        &mut self,
        mel: &Array,
        state: &mut EncoderStreamState,
    ) -> Result<Option<Array>> {
        self.encoder.encode_step(mel, state, &mut self.adaptor)
    }

    /// Default decoder cache window: at least 256 positions.
    pub fn decoder_window(&self) -> i32 {
        self.config.sliding_window.max(256)
    }
}

/// Resolve `--model` into a local directory.
///
/// An existing directory is used as-is; otherwise the spec is treated as a
/// Hugging Face repo id and the model files are fetched into the hub cache
/// (`HF_HUB_CACHE` / `HF_HOME`), authenticating with `HF_TOKEN` or
/// `HUGGINGFACE_HUB_TOKEN` when set.
pub fn resolve_model(spec: &str) -> Result<PathBuf> {
    let path = Path::new(spec);
    if path.is_dir() {
        return Ok(path.to_path_buf());
    }
    if path.exists() {
        return Err(Error::InvalidModelSpec(format!(
            "{spec} is not a directory"
        )));
    }
    if !spec.contains('/') {
        return Err(Error::InvalidModelSpec(format!(
            "{spec} is neither a directory nor a repo id"
        )));
    }

    let token = std::env::var("HF_TOKEN")
        .or_else(|_| std::env::var("HUGGINGFACE_HUB_TOKEN"))
        .ok()
        .or_else(|| {
            let home = std::env::var("HOME").ok()?;
            let token_path = PathBuf::from(home).join(".cache/huggingface/token");
            std::fs::read_to_string(token_path)
                .ok()
                .map(|s| s.trim().to_string())
        });

    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_token(token)
        .build()
        .map_err(|e| Error::InvalidModelSpec(format!("hub api: {e}")))?;
    let repo = api.model(spec.to_string());

    eprintln!("Resolving {spec} from the Hugging Face hub...");
    let tekken = repo
        .get("tekken.json")
        .map_err(|e| Error::InvalidModelSpec(format!("{spec}: tekken.json: {e}")))?;

    if repo.get("params.json").is_ok() {
        repo.get("consolidated.safetensors")
            .map_err(|e| Error::MissingFile(format!("{spec}: consolidated.safetensors: {e}")))?;
    } else {
        repo.get("config.json")
            .map_err(|_| Error::UnsupportedModelFormat(format!("{spec}: no params.json or config.json")))?;
        if repo.get("model.safetensors").is_err() {
            let index = repo.get("model.safetensors.index.json").map_err(|e| {
                Error::MissingFile(format!("{spec}: model safetensors index: {e}"))
            })?;
            let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index)?)?;
            let mut shards: Vec<String> = index["weight_map"]
                .as_object()
                .map(|m| m.values().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default();
            shards.sort();
            shards.dedup();
            for shard in shards {
                repo.get(&shard)
                    .map_err(|e| Error::MissingFile(format!("{spec}: {shard}: {e}")))?;
            }
        }
    }

    let dir = tekken
        .parent()
        .ok_or_else(|| Error::InvalidModelSpec(spec.to_string()))?;
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_names_are_invalid_model_specs() {
        assert!(matches!(
            resolve_model("definitely-not-a-dir"),
            Err(Error::InvalidModelSpec(_))
        ));
    }

    #[test]
    fn load_requires_tokenizer_file() {
        let dir = std::env::temp_dir().join("voxtral-model-load-test");
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            VoxtralModel::load(&dir),
            Err(Error::MissingFile(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
