//! Downsample adaptor.
//!
//! Groups of `downsample_factor` encoder frames arrive pre-flattened as
//! `(rows, k * enc_dim)` vectors and are projected into the decoder
//! embedding space through two bias-free linears with a GELU between.

use mlx_rs::{
    builder::Builder,
    error::Exception,
    macros::ModuleParameters,
    module::Module,
    nn, Array,
};

use crate::error::Result;

#[derive(Debug, Clone, ModuleParameters)]
pub struct DownsampleAdaptor {
    #[param]
    pub w_in: nn::Linear,
    #[param]
    pub w_out: nn::Linear,
}

impl DownsampleAdaptor {
    /// `grouped_dim` is `downsample_factor * encoder_dim`; `dim` the
    /// decoder embedding size.
    pub fn new(grouped_dim: i32, dim: i32) -> Result<Self> {
        Ok(Self {
            w_in: nn::LinearBuilder::new(grouped_dim, dim).bias(false).build()?,
            w_out: nn::LinearBuilder::new(dim, dim).bias(false).build()?,
        })
    }
}

impl Module<&Array> for DownsampleAdaptor {
    type Output = Array;
    type Error = Exception;

    fn training_mode(&mut self, _mode: bool) {}

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Self::Error> {
        let h = self.w_in.forward(x)?;
        let h = nn::gelu(&h)?;
        self.w_out.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_grouped_rows_to_decoder_dim() {
        let mut adaptor = DownsampleAdaptor::new(4 * 16, 32).unwrap();
        let x = Array::zeros::<f32>(&[5, 64]).unwrap();
        let out = adaptor.forward(&x).unwrap();
        assert_eq!(out.shape(), &[5, 32]);
    }
}
