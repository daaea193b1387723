//! Safetensors weight loading and name remapping.
//!
//! Original Mistral checkpoints prefix the multimodal tower names and use
//! `wq`/`w1`-style projection names; converted checkpoints already use this
//! crate's parameter tree (optionally under a `model.` prefix). Either way
//! every tensor is rewritten onto the flattened `ModuleParameters` names
//! before assignment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use mlx_rs::module::ModuleParameters as _;
use mlx_rs::transforms::eval;
use mlx_rs::Array;

use crate::config::ModelFormat;
use crate::error::{Error, Result};
use crate::model::VoxtralModel;

/// Rewrite an original-format tensor name onto the crate parameter tree.
///
/// Returns `None` for tensors that are dropped on load (`output.weight` —
/// the output projection always aliases the token embedding).
pub fn remap_original_key(name: &str) -> Option<String> {
    let name = name
        .strip_prefix("mm_streams_embeddings.embedding_module.")
        .or_else(|| name.strip_prefix("mm_whisper_embeddings."))
        .unwrap_or(name);

    if name == "output.weight" {
        return None;
    }

    if name == "audio_language_projection.0.weight" {
        return Some("adaptor.w_in.weight".to_string());
    }
    if name == "audio_language_projection.2.weight" {
        return Some("adaptor.w_out.weight".to_string());
    }

    if let Some(rest) = name.strip_prefix("whisper_encoder.") {
        if let Some(tail) = rest.strip_prefix("conv_layers.0.conv.") {
            return Some(format!("encoder.conv1.{tail}"));
        }
        if let Some(tail) = rest.strip_prefix("conv_layers.1.conv.") {
            return Some(format!("encoder.conv2.{tail}"));
        }
        if let Some(tail) = rest.strip_prefix("transformer.") {
            return Some(format!("encoder.{}", rewrite_block(tail)));
        }
        return None;
    }

    if name == "tok_embeddings.weight" {
        return Some("decoder.embed_tokens.weight".to_string());
    }
    Some(format!("decoder.{}", rewrite_block(name)))
}

/// Shared transformer-block rewrites (attention, feed-forward, ada norm).
fn rewrite_block(name: &str) -> String {
    name.replace(".attention.wq.", ".attention.q_proj.")
        .replace(".attention.wk.", ".attention.k_proj.")
        .replace(".attention.wv.", ".attention.v_proj.")
        .replace(".attention.wo.", ".attention.o_proj.")
        .replace(".feed_forward.w1.", ".mlp.gate_proj.")
        .replace(".feed_forward.w3.", ".mlp.up_proj.")
        .replace(".feed_forward.w2.", ".mlp.down_proj.")
        .replace(".ada_rms_norm_t_cond.0.", ".ada_norm.w_in.")
        .replace(".ada_rms_norm_t_cond.2.", ".ada_norm.w_out.")
}

/// Converted checkpoints carry our names, possibly under `model.`.
pub fn remap_converted_key(name: &str) -> Option<String> {
    let name = name.strip_prefix("model.").unwrap_or(name);
    if name == "output.weight" || name == "lm_head.weight" {
        return None;
    }
    Some(name.to_string())
}

fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|e| e == "safetensors").unwrap_or(false))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(Error::MissingFile(format!(
            "*.safetensors in {}",
            dir.display()
        )));
    }
    Ok(files)
}

/// Load every safetensors shard in `dir` into the model parameters.
pub fn load_weights(model: &mut VoxtralModel, dir: &Path, format: ModelFormat) -> Result<()> {
    let mut tensors: HashMap<String, Array> = HashMap::new();
    for file in safetensors_files(dir)? {
        eprintln!("Loading {}...", file.file_name().unwrap_or_default().to_string_lossy());
        for (name, value) in Array::load_safetensors(&file)? {
            tensors.insert(name, value);
        }
    }

    let mut params = model.parameters_mut().flatten();
    let mut loaded = 0usize;
    let mut skipped: Vec<String> = Vec::new();

    for (name, mut value) in tensors {
        let mapped = match format {
            ModelFormat::Original => remap_original_key(&name),
            ModelFormat::Converted => remap_converted_key(&name),
        };
        let Some(mapped) = mapped else { continue };

        // Original conv weights are (out, in, k); MLX wants (out, k, in).
        if format == ModelFormat::Original
            && (mapped == "encoder.conv1.weight" || mapped == "encoder.conv2.weight")
        {
            value = value.transpose_axes(&[0, 2, 1])?;
        }

        if let Some(param) = params.get_mut(mapped.as_str()) {
            **param = value;
            loaded += 1;
        } else {
            skipped.push(name);
        }
    }

    eprintln!("Loaded {loaded} tensors");
    if !skipped.is_empty() {
        skipped.sort();
        eprintln!(
            "Skipped {} tensors: {:?}",
            skipped.len(),
            &skipped[..skipped.len().min(8)]
        );
    }

    eval(params.values().map(|v| &**v))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_decoder_names() {
        assert_eq!(
            remap_original_key("mm_streams_embeddings.embedding_module.tok_embeddings.weight")
                .as_deref(),
            Some("decoder.embed_tokens.weight")
        );
        assert_eq!(
            remap_original_key("layers.3.attention.wq.weight").as_deref(),
            Some("decoder.layers.3.attention.q_proj.weight")
        );
        assert_eq!(
            remap_original_key("layers.0.feed_forward.w2.weight").as_deref(),
            Some("decoder.layers.0.mlp.down_proj.weight")
        );
        assert_eq!(
            remap_original_key("layers.12.ada_rms_norm_t_cond.2.weight").as_deref(),
            Some("decoder.layers.12.ada_norm.w_out.weight")
        );
        assert_eq!(remap_original_key("norm.weight").as_deref(), Some("decoder.norm.weight"));
        assert_eq!(remap_original_key("output.weight"), None);
    }

    #[test]
    fn remaps_encoder_and_adaptor_names() {
        assert_eq!(
            remap_original_key("mm_whisper_embeddings.whisper_encoder.conv_layers.0.conv.weight")
                .as_deref(),
            Some("encoder.conv1.weight")
        );
        assert_eq!(
            remap_original_key(
                "mm_whisper_embeddings.whisper_encoder.transformer.layers.5.attention.wo.bias"
            )
            .as_deref(),
            Some("encoder.layers.5.attention.o_proj.bias")
        );
        assert_eq!(
            remap_original_key("mm_whisper_embeddings.whisper_encoder.transformer.norm.weight")
                .as_deref(),
            Some("encoder.norm.weight")
        );
        assert_eq!(
            remap_original_key("mm_whisper_embeddings.audio_language_projection.0.weight")
                .as_deref(),
            Some("adaptor.w_in.weight")
        );
    }

    #[test]
    fn converted_names_pass_through() {
        assert_eq!(
            remap_converted_key("model.decoder.layers.0.attention.q_proj.weight").as_deref(),
            Some("decoder.layers.0.attention.q_proj.weight")
        );
        assert_eq!(
            remap_converted_key("encoder.conv1.weight").as_deref(),
            Some("encoder.conv1.weight")
        );
        assert_eq!(remap_converted_key("lm_head.weight"), None);
    }
}
