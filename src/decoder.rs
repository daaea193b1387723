//! Causal language decoder.
//!
//! A sliding-window transformer with grouped-query attention, SwiGLU
//! feed-forward, and a per-layer adaptive RMS-norm scale conditioned on
//! the transcription delay. The token embedding is tied: the same matrix
//! embeds inputs and, transposed, projects hidden states to logits.

use mlx_rs::fast::{scaled_dot_product_attention, ScaledDotProductAttentionMask};
use mlx_rs::transforms::eval;
use mlx_rs::{
    builder::Builder,
    macros::ModuleParameters,
    module::Module,
    nn, Array,
};

use crate::cache::{KeyValueCache, RotatingKvCache};
use crate::config::VoxtralConfig;
use crate::error::Result;

/// Sinusoidal time embedding for the adaptive norm conditioning.
///
/// `concat(cos(t * inv_freq), sin(t * inv_freq))` with
/// `inv_freq[i] = exp(-ln(10000) * i / (dim / 2))`.
pub fn time_embedding(t: f32, dim: i32) -> Array {
    let half = (dim / 2) as usize;
    let theta: f32 = 10_000.0;
    let mut data = vec![0.0f32; half * 2];
    for i in 0..half {
        let inv_freq = (-(theta.ln()) * (i as f32) / (half as f32)).exp();
        data[i] = (t * inv_freq).cos();
        data[half + i] = (t * inv_freq).sin();
    }
    Array::from_slice(&data, &[dim])
}

// ── Adaptive norm conditioning ───────────────────────────────────────────────

/// Two bias-free linears with a GELU, mapping the time embedding to a
/// per-channel scale delta.
#[derive(Debug, Clone, ModuleParameters)]
pub struct AdaRmsNorm {
    #[param]
    pub w_in: nn::Linear,
    #[param]
    pub w_out: nn::Linear,
}

impl AdaRmsNorm {
    pub fn new(dim: i32, cond_dim: i32) -> Result<Self> {
        Ok(Self {
            w_in: nn::LinearBuilder::new(dim, cond_dim).bias(false).build()?,
            w_out: nn::LinearBuilder::new(cond_dim, dim).bias(false).build()?,
        })
    }
}

impl Module<&Array> for AdaRmsNorm {
    type Output = Array;
    type Error = mlx_rs::error::Exception;

    fn training_mode(&mut self, _mode: bool) {}

    fn forward(&mut self, t_cond: &Array) -> std::result::Result<Array, Self::Error> {
        let h = self.w_in.forward(t_cond)?;
        let h = nn::gelu(&h)?;
        self.w_out.forward(&h)
    }
}

// ── Attention ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ModuleParameters)]
pub struct DecoderAttention {
    #[param]
    pub q_proj: nn::Linear,
    #[param]
    pub k_proj: nn::Linear,
    #[param]
    pub v_proj: nn::Linear,
    #[param]
    pub o_proj: nn::Linear,
    #[param]
    pub rope: nn::Rope,

    pub n_heads: i32,
    pub n_kv_heads: i32,
    pub head_dim: i32,
    pub scale: f32,
}

impl DecoderAttention {
    pub fn new(config: &VoxtralConfig) -> Result<Self> {
        let dim = config.dim;
        let n_heads = config.n_heads;
        let n_kv_heads = config.n_kv_heads;
        let head_dim = config.head_dim;
        debug_assert!(n_heads % n_kv_heads == 0);

        let rope = nn::RopeBuilder::new(head_dim)
            .traditional(true)
            .base(config.rope_theta)
            .build()?;

        Ok(Self {
            q_proj: nn::LinearBuilder::new(dim, n_heads * head_dim).bias(false).build()?,
            k_proj: nn::LinearBuilder::new(dim, n_kv_heads * head_dim).bias(false).build()?,
            v_proj: nn::LinearBuilder::new(dim, n_kv_heads * head_dim).bias(false).build()?,
            o_proj: nn::LinearBuilder::new(n_heads * head_dim, dim).bias(false).build()?,
            rope,
            n_heads,
            n_kv_heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
        })
    }

    pub fn forward_with_cache(
        &mut self,
        x: &Array,
        cache: &mut RotatingKvCache,
        causal: bool,
    ) -> Result<Array> {
        let shape = x.shape();
        let (batch, seq_len) = (shape[0], shape[1]);

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        let q = q
            .reshape(&[batch, seq_len, self.n_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let k = k
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let v = v
            .reshape(&[batch, seq_len, self.n_kv_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;

        let offset = cache.offset();
        let q = self
            .rope
            .forward(nn::RopeInputBuilder::new(&q).offset(offset).build()?)?;
        let k = self
            .rope
            .forward(nn::RopeInputBuilder::new(&k).offset(offset).build()?)?;
        let (k, v) = cache.update_and_fetch(k, v)?;

        let attn = if causal {
            scaled_dot_product_attention(
                q,
                k,
                v,
                self.scale,
                ScaledDotProductAttentionMask::Causal,
            )?
        } else {
            scaled_dot_product_attention(
                q,
                k,
                v,
                self.scale,
                None::<ScaledDotProductAttentionMask>,
            )?
        };

        let attn = attn
            .transpose_axes(&[0, 2, 1, 3])?
            .reshape(&[batch, seq_len, self.n_heads * self.head_dim])?;
        Ok(self.o_proj.forward(&attn)?)
    }
}

// ── MLP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ModuleParameters)]
pub struct DecoderMlp {
    #[param]
    pub gate_proj: nn::Linear,
    #[param]
    pub up_proj: nn::Linear,
    #[param]
    pub down_proj: nn::Linear,
}

impl DecoderMlp {
    pub fn new(dim: i32, hidden_dim: i32) -> Result<Self> {
        Ok(Self {
            gate_proj: nn::LinearBuilder::new(dim, hidden_dim).bias(false).build()?,
            up_proj: nn::LinearBuilder::new(dim, hidden_dim).bias(false).build()?,
            down_proj: nn::LinearBuilder::new(hidden_dim, dim).bias(false).build()?,
        })
    }
}

impl Module<&Array> for DecoderMlp {
    type Output = Array;
    type Error = mlx_rs::error::Exception;

    fn training_mode(&mut self, _mode: bool) {}

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Self::Error> {
        let gate = self.gate_proj.forward(x)?;
        let up = self.up_proj.forward(x)?;
        let activated = nn::silu(&gate)?.multiply(&up)?;
        self.down_proj.forward(&activated)
    }
}

// ── Layer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ModuleParameters)]
pub struct DecoderLayer {
    #[param]
    pub attention: DecoderAttention,
    #[param]
    pub attention_norm: nn::RmsNorm,
    #[param]
    pub mlp: DecoderMlp,
    #[param]
    pub ffn_norm: nn::RmsNorm,
    #[param]
    pub ada_norm: AdaRmsNorm,
}

impl DecoderLayer {
    pub fn new(config: &VoxtralConfig) -> Result<Self> {
        Ok(Self {
            attention: DecoderAttention::new(config)?,
            attention_norm: nn::RmsNormBuilder::new(config.dim)
                .eps(config.norm_eps)
                .build()?,
            mlp: DecoderMlp::new(config.dim, config.hidden_dim)?,
            ffn_norm: nn::RmsNormBuilder::new(config.dim)
                .eps(config.norm_eps)
                .build()?,
            ada_norm: AdaRmsNorm::new(config.dim, config.ada_rms_norm_t_cond_dim)?,
        })
    }

    /// Scale applied to the normed MLP input: `1 + ada_norm(t_cond)`.
    pub fn ada_scale(&mut self, t_cond: &Array) -> Result<Array> {
        Ok(self.ada_norm.forward(t_cond)?.add(mlx_rs::array!(1.0))?)
    }

    pub fn forward_with_cache(
        &mut self,
        x: &Array,
        cache: &mut RotatingKvCache,
        causal: bool,
        ada_scale: Option<&Array>,
    ) -> Result<Array> {
        let h = self.attention_norm.forward(x)?;
        let h = self.attention.forward_with_cache(&h, cache, causal)?;
        let x = x.add(&h)?;

        let mut h = self.ffn_norm.forward(&x)?;
        if let Some(scale) = ada_scale {
            h = h.multiply(scale)?;
        }
        let h = self.mlp.forward(&h)?;
        Ok(x.add(&h)?)
    }
}

// ── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ModuleParameters)]
pub struct LanguageModel {
    #[param]
    pub embed_tokens: nn::Embedding,
    #[param]
    pub layers: Vec<DecoderLayer>,
    #[param]
    pub norm: nn::RmsNorm,

    pub dim: i32,
    pub sliding_window: i32,
}

impl LanguageModel {
    pub fn new(config: &VoxtralConfig) -> Result<Self> {
        let layers: Result<Vec<_>> = (0..config.n_layers)
            .map(|_| DecoderLayer::new(config))
            .collect();

        Ok(Self {
            embed_tokens: nn::Embedding::new(config.vocab_size, config.dim)?,
            layers: layers?,
            norm: nn::RmsNormBuilder::new(config.dim)
                .eps(config.norm_eps)
                .build()?,
            dim: config.dim,
            sliding_window: config.sliding_window,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn caches(&self, window: i32) -> Vec<RotatingKvCache> {
        (0..self.layers.len())
            .map(|_| RotatingKvCache::new(window))
            .collect()
    }

    /// Per-layer adaptive-norm scales for a fixed time embedding.
    pub fn ada_scales(&mut self, t_cond: &Array) -> Result<Vec<Array>> {
        let mut scales = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter_mut() {
            scales.push(layer.ada_scale(t_cond)?);
        }
        eval(scales.iter())?;
        Ok(scales)
    }

    pub fn embed(&mut self, ids: &Array) -> Result<Array> {
        Ok(self.embed_tokens.forward(ids)?)
    }

    /// Forward input embeddings `(1, L, dim)` to post-norm hidden states.
    pub fn forward_embeddings(
        &mut self,
        embeddings: &Array,
        caches: &mut [RotatingKvCache],
        causal: bool,
        ada_scales: Option<&[Array]>,
    ) -> Result<Array> {
        let mut h = embeddings.clone();
        for (i, (layer, cache)) in self.layers.iter_mut().zip(caches.iter_mut()).enumerate() {
            let scale = ada_scales.map(|s| &s[i]);
            h = layer.forward_with_cache(&h, cache, causal, scale)?;
        }
        Ok(self.norm.forward(&h)?)
    }

    /// Logits through the tied embedding.
    pub fn logits(&mut self, hidden: &Array) -> Result<Array> {
        Ok(self.embed_tokens.as_linear(hidden)?)
    }
}

// ── Sampling ─────────────────────────────────────────────────────────────────

/// Sample a token id from last-position logits.
///
/// Greedy argmax when `temperature <= 0`; otherwise a categorical draw from
/// `softmax(logits / temperature)`.
pub fn sample(logits: &Array, temperature: f32) -> Result<i32> {
    let flat = logits.flatten(None, None)?.as_dtype(mlx_rs::Dtype::Float32)?;
    eval([&flat])?;
    let values: Vec<f32> = flat.try_as_slice::<f32>()?.to_vec();

    if temperature <= 0.0 {
        return Ok(argmax(&values));
    }

    let scaled: Vec<f32> = values.iter().map(|v| v / temperature).collect();
    let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = scaled.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();

    let rand = mlx_rs::random::uniform::<f32, f32>(0.0, 1.0, &[], None)?;
    eval([&rand])?;
    let r: f32 = rand.item();

    let mut cumsum = 0.0f32;
    for (i, e) in exp.iter().enumerate() {
        cumsum += e / sum;
        if r < cumsum {
            return Ok(i as i32);
        }
    }
    Ok(argmax(&values))
}

fn argmax(values: &[f32]) -> i32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as i32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::ops;

    fn to_vec(arr: &Array) -> Vec<f32> {
        let c = ops::contiguous(arr).unwrap();
        eval([&c]).unwrap();
        c.try_as_slice::<f32>().unwrap().to_vec()
    }

    #[test]
    fn time_embedding_at_zero_is_cos_one_sin_zero() {
        let emb = to_vec(&time_embedding(0.0, 8));
        assert_eq!(emb.len(), 8);
        for &v in &emb[..4] {
            assert!((v - 1.0).abs() < 1e-6);
        }
        for &v in &emb[4..] {
            assert!(v.abs() < 1e-6);
        }
    }

    #[test]
    fn time_embedding_first_channel_tracks_t() {
        let emb = to_vec(&time_embedding(6.0, 8));
        assert!((emb[0] - 6.0f32.cos()).abs() < 1e-5);
        assert!((emb[4] - 6.0f32.sin()).abs() < 1e-5);
    }

    #[test]
    fn ada_scale_shape_matches_dim() {
        let mut ada = AdaRmsNorm::new(16, 4).unwrap();
        let t = time_embedding(6.0, 16);
        let delta = ada.forward(&t).unwrap();
        assert_eq!(delta.shape(), &[16]);
    }

    #[test]
    fn greedy_sample_is_argmax() {
        let logits = Array::from_slice(&[0.1f32, 2.5, -1.0, 0.4], &[1, 4]);
        assert_eq!(sample(&logits, 0.0).unwrap(), 1);
        assert_eq!(sample(&logits, -1.0).unwrap(), 1);
    }

    #[test]
    fn tempered_sample_respects_support() {
        // One finite logit: the draw can only pick it.
        let logits = Array::from_slice(
            &[f32::NEG_INFINITY, f32::NEG_INFINITY, 3.0, f32::NEG_INFINITY],
            &[1, 4],
        );
        for _ in 0..8 {
            assert_eq!(sample(&logits, 0.8).unwrap(), 2);
        }
    }
}
