//! Streaming Whisper-style audio encoder.
//!
//! Two causal 1-D convolutions (the second with stride 2) feed a
//! transformer whose attention layers use rotary positions and rotating
//! KV caches bounded by the encoder sliding window. The encoder runs in
//! two modes: `encode` for whole clips and `encode_step` for chunked
//! streaming, where conv tails and the downsample remainder carry state
//! between calls.

use mlx_rs::fast::{scaled_dot_product_attention, ScaledDotProductAttentionMask};
use mlx_rs::ops;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::{
    builder::Builder,
    macros::ModuleParameters,
    module::Module,
    nn, Array,
};

use crate::adaptor::DownsampleAdaptor;
use crate::cache::{KeyValueCache, RotatingKvCache};
use crate::config::EncoderConfig;
use crate::error::Result;

/// Largest transformer chunk used by the offline path.
const OFFLINE_CHUNK: i32 = 256;

fn pad_left(x: &Array, n: i32) -> Result<Array> {
    Ok(ops::pad(x, &[(0, 0), (n, 0), (0, 0)], None, None)?)
}

// ── Attention ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ModuleParameters)]
pub struct EncoderAttention {
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
    pub head_dim: i32,
    pub scale: f32,
}

impl EncoderAttention {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let dim = config.dim;
        let n_heads = config.n_heads;
        let head_dim = config.head_dim;

        let rope = nn::RopeBuilder::new(head_dim)
            .traditional(true)
            .base(config.rope_theta)
            .build()?;

        Ok(Self {
            q_proj: nn::LinearBuilder::new(dim, n_heads * head_dim).bias(true).build()?,
            k_proj: nn::LinearBuilder::new(dim, n_heads * head_dim).bias(false).build()?,
            v_proj: nn::LinearBuilder::new(dim, n_heads * head_dim).bias(true).build()?,
            o_proj: nn::LinearBuilder::new(n_heads * head_dim, dim).bias(true).build()?,
            rope,
            n_heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
        })
    }

    pub fn forward_with_cache(
        &mut self,
        x: &Array,
        cache: &mut RotatingKvCache,
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
            .reshape(&[batch, seq_len, self.n_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;
        let v = v
            .reshape(&[batch, seq_len, self.n_heads, self.head_dim])?
            .transpose_axes(&[0, 2, 1, 3])?;

        let offset = cache.offset();
        let q = self
            .rope
            .forward(nn::RopeInputBuilder::new(&q).offset(offset).build()?)?;
        let k = self
            .rope
            .forward(nn::RopeInputBuilder::new(&k).offset(offset).build()?)?;
        let (k, v) = cache.update_and_fetch(k, v)?;

        let attn = if seq_len > 1 {
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

/// SwiGLU feed-forward.
#[derive(Debug, Clone, ModuleParameters)]
pub struct EncoderMlp {
    #[param]
    pub gate_proj: nn::Linear,
    #[param]
    pub up_proj: nn::Linear,
    #[param]
    pub down_proj: nn::Linear,
}

impl EncoderMlp {
    pub fn new(dim: i32, hidden_dim: i32) -> Result<Self> {
        Ok(Self {
            gate_proj: nn::LinearBuilder::new(dim, hidden_dim).bias(false).build()?,
            up_proj: nn::LinearBuilder::new(dim, hidden_dim).bias(false).build()?,
            down_proj: nn::LinearBuilder::new(hidden_dim, dim).bias(false).build()?,
        })
    }
}

impl Module<&Array> for EncoderMlp {
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
pub struct EncoderLayer {
    #[param]
    pub attention: EncoderAttention,
    #[param]
    pub attention_norm: nn::RmsNorm,
    #[param]
    pub mlp: EncoderMlp,
    #[param]
    pub ffn_norm: nn::RmsNorm,
}

impl EncoderLayer {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            attention: EncoderAttention::new(config)?,
            attention_norm: nn::RmsNormBuilder::new(config.dim)
                .eps(config.norm_eps)
                .build()?,
            mlp: EncoderMlp::new(config.dim, config.hidden_dim)?,
            ffn_norm: nn::RmsNormBuilder::new(config.dim)
                .eps(config.norm_eps)
                .build()?,
        })
    }

    pub fn forward_with_cache(
        &mut self,
        x: &Array,
        cache: &mut RotatingKvCache,
    ) -> Result<Array> {
        let h = self.attention_norm.forward(x)?;
        let h = self.attention.forward_with_cache(&h, cache)?;
        let x = x.add(&h)?;

        let h = self.ffn_norm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok(x.add(&h)?)
    }
}

// ── Streaming state ──────────────────────────────────────────────────────────

/// Per-stream encoder state carried between `encode_step` calls.
#[derive(Debug, Clone)]
pub struct EncoderStreamState {
    /// Last 2 raw mel frames fed to conv1, `(1, 2, n_mels)`.
    conv1_tail: Option<Array>,
    /// Unconsumed conv1 output frames for conv2's stride grid, `(1, t, dim)`.
    conv2_tail: Option<Array>,
    /// One rotating cache per transformer layer.
    caches: Vec<RotatingKvCache>,
    /// Encoder rows not yet aligned on the downsample factor, `(rows, dim)`.
    downsample_buf: Option<Array>,
}

impl EncoderStreamState {
    pub fn new(n_layers: usize, sliding_window: i32) -> Self {
        Self {
            conv1_tail: None,
            conv2_tail: None,
            caches: (0..n_layers)
                .map(|_| RotatingKvCache::new(sliding_window))
                .collect(),
            downsample_buf: None,
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, ModuleParameters)]
pub struct AudioEncoder {
    /// Conv1: n_mels -> dim, k=3, s=1, causal left pad 2
    #[param]
    pub conv1: nn::Conv1d,
    /// Conv2: dim -> dim, k=3, s=2, causal left pad 1
    #[param]
    pub conv2: nn::Conv1d,
    #[param]
    pub layers: Vec<EncoderLayer>,
    #[param]
    pub norm: nn::RmsNorm,

    pub config: EncoderConfig,
    pub downsample_factor: i32,
}

impl AudioEncoder {
    pub fn new(config: EncoderConfig, downsample_factor: i32) -> Result<Self> {
        let n_mels = config.audio_encoding_args.num_mel_bins;
        let dim = config.dim;

        let conv1 = nn::Conv1dBuilder::new(n_mels, dim, 3).build()?;
        let conv2 = nn::Conv1dBuilder::new(dim, dim, 3).stride(2).build()?;

        let layers: Result<Vec<_>> = (0..config.n_layers)
            .map(|_| EncoderLayer::new(&config))
            .collect();

        let norm = nn::RmsNormBuilder::new(dim).eps(config.norm_eps).build()?;

        Ok(Self {
            conv1,
            conv2,
            layers: layers?,
            norm,
            config,
            downsample_factor,
        })
    }

    pub fn stream_state(&self) -> EncoderStreamState {
        EncoderStreamState::new(self.layers.len(), self.config.sliding_window)
    }

    /// Whole-clip conv frontend: causal pads on the left, GELU after each.
    fn conv_frontend(&mut self, x: &Array) -> Result<Array> {
        let x = pad_left(x, 2)?;
        let x = nn::gelu(&self.conv1.forward(&x)?)?;
        let x = pad_left(&x, 1)?;
        Ok(nn::gelu(&self.conv2.forward(&x)?)?)
    }

    /// Incremental conv frontend; consumes and refreshes the stream tails.
    fn conv_step(&mut self, x: &Array, state: &mut EncoderStreamState) -> Result<Array> {
        // Conv1: kernel 3, stride 1. The stride grid always leaves exactly
        // two trailing input frames for the next chunk.
        let conv1_in = match &state.conv1_tail {
            Some(tail) => ops::concatenate_axis(&[tail, x], 1)?,
            None => pad_left(x, 2)?,
        };
        let in_len = conv1_in.dim(1);
        state.conv1_tail = Some(conv1_in.index((.., (in_len - 2).., ..)));
        let conv1_out = nn::gelu(&self.conv1.forward(&conv1_in)?)?;

        // Conv2: kernel 3, stride 2. Retention follows the stride grid so
        // chunk boundaries land on the same outputs as the offline conv.
        let conv2_in = match &state.conv2_tail {
            Some(tail) => ops::concatenate_axis(&[tail, &conv1_out], 1)?,
            None => pad_left(&conv1_out, 1)?,
        };
        let len = conv2_in.dim(1);
        let frames = if len >= 3 { (len - 3) / 2 + 1 } else { 0 };
        state.conv2_tail = Some(conv2_in.index((.., (2 * frames).., ..)));
        if frames == 0 {
            return Ok(Array::zeros::<f32>(&[1, 0, self.config.dim])?);
        }
        let conv2_in = conv2_in.index((.., ..(2 * frames + 1).min(len), ..));
        Ok(nn::gelu(&self.conv2.forward(&conv2_in)?)?)
    }

    fn transformer(
        &mut self,
        x: &Array,
        caches: &mut [RotatingKvCache],
    ) -> Result<Array> {
        let mut h = x.clone();
        for (layer, cache) in self.layers.iter_mut().zip(caches.iter_mut()) {
            h = layer.forward_with_cache(&h, cache)?;
        }
        Ok(self.norm.forward(&h)?)
    }

    /// Group rows by the downsample factor and project them.
    ///
    /// `rows` is `(n, dim)`; the leading remainder is dropped when
    /// `drop_leading`, otherwise the trailing remainder is returned.
    fn group_and_project(
        &self,
        rows: Array,
        adaptor: &mut DownsampleAdaptor,
        drop_leading: bool,
    ) -> Result<(Option<Array>, Option<Array>)> {
        let k = self.downsample_factor;
        let n = rows.dim(0);
        let rem = n % k;

        let (aligned, leftover) = if drop_leading {
            (rows.index((rem.., ..)), None)
        } else if rem > 0 {
            (
                rows.index((..(n - rem), ..)),
                Some(rows.index(((n - rem).., ..))),
            )
        } else {
            (rows, None)
        };

        let groups = aligned.dim(0) / k;
        if groups == 0 {
            return Ok((None, leftover));
        }
        let grouped = aligned.reshape(&[groups, k * self.config.dim])?;
        Ok((Some(adaptor.forward(&grouped)?), leftover))
    }

    /// Offline encode of a full mel spectrogram `(n_mels, frames)`.
    ///
    /// Returns decoder-dim audio embeddings `(rows, dim)`.
    pub fn encode(&mut self, mel: &Array, adaptor: &mut DownsampleAdaptor) -> Result<Array> {
        let dim = adaptor.w_out.weight.as_ref().dim(0);
        let frames = mel.dim(1);
        if frames < 2 {
            return Ok(Array::zeros::<f32>(&[0, dim])?);
        }
        // Odd frame counts break the stride-2 grid; drop the first frame.
        let mel = if frames % 2 == 1 {
            mel.index((.., 1..))
        } else {
            mel.clone()
        };

        let x = mel.transpose_axes(&[1, 0])?.expand_dims(0)?;
        let x = x.as_dtype(self.conv1.weight.as_ref().dtype())?;
        let x = self.conv_frontend(&x)?;

        let mut caches: Vec<RotatingKvCache> = (0..self.layers.len())
            .map(|_| RotatingKvCache::new(self.config.sliding_window))
            .collect();

        let chunk = OFFLINE_CHUNK.min(self.config.sliding_window);
        let total = x.dim(1);
        let mut outputs = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + chunk).min(total);
            let piece = x.index((.., start..end, ..));
            outputs.push(self.transformer(&piece, &mut caches)?);
            start = end;
        }
        let refs: Vec<&Array> = outputs.iter().collect();
        let out = ops::concatenate_axis(&refs, 1)?;

        let rows = out.index((0, .., ..));
        let (embeds, _) = self.group_and_project(rows, adaptor, true)?;
        match embeds {
            Some(e) => Ok(e),
            None => Ok(Array::zeros::<f32>(&[0, dim])?),
        }
    }

    /// One streaming encode step over freshly produced mel frames.
    ///
    /// Returns new decoder-dim audio embeddings `(rows, dim)`, or `None`
    /// when no full downsample group is available yet.
    pub fn encode_step(
        &mut self,
        new_mel: &Array,
        state: &mut EncoderStreamState,
        adaptor: &mut DownsampleAdaptor,
    ) -> Result<Option<Array>> {
        if new_mel.dim(1) == 0 {
            return Ok(None);
        }

        let x = new_mel.transpose_axes(&[1, 0])?.expand_dims(0)?;
        let x = x.as_dtype(self.conv1.weight.as_ref().dtype())?;
        let x = self.conv_step(&x, state)?;
        if x.dim(1) == 0 {
            return Ok(None);
        }

        let out = self.transformer(&x, &mut state.caches)?;
        let new_rows = out.index((0, .., ..));

        let rows = match state.downsample_buf.take() {
            Some(buf) => ops::concatenate_axis(&[&buf, &new_rows], 0)?,
            None => new_rows,
        };

        let (embeds, leftover) = self.group_and_project(rows, adaptor, false)?;
        state.downsample_buf = leftover;
        Ok(embeds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AudioEncodingConfig;
    use mlx_rs::transforms::eval;

    fn tiny_config() -> EncoderConfig {
        EncoderConfig {
            audio_encoding_args: AudioEncodingConfig {
                sampling_rate: 16_000,
                frame_rate: 12.5,
                num_mel_bins: 8,
                hop_length: 160,
                window_size: 400,
                global_log_mel_max: 1.5,
            },
            dim: 16,
            n_layers: 2,
            head_dim: 4,
            hidden_dim: 32,
            n_heads: 4,
            rope_theta: 1_000_000.0,
            norm_eps: 1e-5,
            sliding_window: 32,
        }
    }

    fn ramp_mel(n_mels: i32, frames: i32) -> Array {
        let data: Vec<f32> = (0..(n_mels * frames))
            .map(|i| ((i % 17) as f32) * 0.05 - 0.4)
            .collect();
        Array::from_slice(&data, &[n_mels, frames])
    }

    fn to_vec(arr: &Array) -> Vec<f32> {
        let c = ops::contiguous(arr).unwrap();
        eval([&c]).unwrap();
        c.try_as_slice::<f32>().unwrap().to_vec()
    }

    #[test]
    fn offline_encode_produces_grouped_rows() {
        let mut enc = AudioEncoder::new(tiny_config(), 4).unwrap();
        let mut adaptor = DownsampleAdaptor::new(4 * 16, 24).unwrap();

        // 40 mel frames -> 20 conv2 frames -> 5 groups of 4.
        let mel = ramp_mel(8, 40);
        let out = enc.encode(&mel, &mut adaptor).unwrap();
        assert_eq!(out.shape(), &[5, 24]);
    }

    #[test]
    fn odd_frame_counts_drop_the_first_frame() {
        let mut enc = AudioEncoder::new(tiny_config(), 4).unwrap();
        let mut adaptor = DownsampleAdaptor::new(4 * 16, 24).unwrap();

        let even = enc.encode(&ramp_mel(8, 40), &mut adaptor).unwrap();
        // 41 frames: first dropped, same 20 conv2 frames.
        let odd = enc.encode(&ramp_mel(8, 41), &mut adaptor).unwrap();
        assert_eq!(even.shape(), odd.shape());
    }

    #[test]
    fn incremental_conv_matches_offline_conv() {
        let mut enc = AudioEncoder::new(tiny_config(), 4).unwrap();
        let mel = ramp_mel(8, 40);
        let x = mel.transpose_axes(&[1, 0]).unwrap().expand_dims(0).unwrap();

        let offline = enc.conv_frontend(&x).unwrap();

        let mut state = enc.stream_state();
        let mut pieces = Vec::new();
        for (start, end) in [(0, 7), (7, 18), (18, 40)] {
            let part = x.index((.., start..end, ..));
            let out = enc.conv_step(&part, &mut state).unwrap();
            if out.dim(1) > 0 {
                pieces.push(out);
            }
        }
        let refs: Vec<&Array> = pieces.iter().collect();
        let streamed = ops::concatenate_axis(&refs, 1).unwrap();

        // Streaming stays one stride group behind offline at the cut.
        let offline_v = to_vec(&offline);
        let streamed_v = to_vec(&streamed);
        assert!(streamed.dim(1) >= offline.dim(1) - 1);
        for (i, (a, b)) in streamed_v.iter().zip(offline_v.iter()).enumerate() {
            assert!((a - b).abs() < 1e-4, "conv mismatch at {i}: {a} vs {b}");
        }
    }

    #[test]
    fn encode_step_buffers_partial_groups() {
        let mut enc = AudioEncoder::new(tiny_config(), 4).unwrap();
        let mut adaptor = DownsampleAdaptor::new(4 * 16, 24).unwrap();
        let mut state = enc.stream_state();

        // 6 mel frames -> 2 conv2 frames: below one group of 4.
        let out = enc
            .encode_step(&ramp_mel(8, 6), &mut state, &mut adaptor)
            .unwrap();
        assert!(out.is_none());

        // 8 more -> 4 more conv2 frames: one full group emerges.
        let out = enc
            .encode_step(&ramp_mel(8, 8), &mut state, &mut adaptor)
            .unwrap();
        let out = out.unwrap();
        assert_eq!(out.shape()[1], 24);
        assert!(out.shape()[0] >= 1);
    }
}
