//! Rotating key/value cache for sliding-window attention.
//!
//! Two update paths share one buffer: multi-token prefill concatenates (and
//! trims to the window), single-token decode writes into a circular buffer
//! whose capacity grows in 256-row steps up to the window size. Readers
//! always go through `update_and_fetch`; the raw buffer is not in temporal
//! order once the write head has wrapped.

use mlx_rs::ops;
use mlx_rs::ops::indexing::{IndexMutOp, IndexOp};
use mlx_rs::Array;

use crate::error::Result;

/// Capacity growth step for in-place decode updates.
const ALLOC_STEP: i32 = 256;

/// Common cache interface used by the attention layers.
pub trait KeyValueCache {
    /// Total positions ever appended; used as the rotary offset.
    fn offset(&self) -> i32;

    /// Append new keys/values and return the attendable views.
    fn update_and_fetch(&mut self, keys: Array, values: Array) -> Result<(Array, Array)>;
}

/// KV cache bounded by a sliding window.
#[derive(Debug, Clone)]
pub struct RotatingKvCache {
    keys: Option<Array>,
    values: Option<Array>,
    offset: i32,
    idx: i32,
    max_size: i32,
}

impl RotatingKvCache {
    pub fn new(max_size: i32) -> Self {
        debug_assert!(max_size > 0);
        Self {
            keys: None,
            values: None,
            offset: 0,
            idx: 0,
            max_size,
        }
    }

    pub fn max_size(&self) -> i32 {
        self.max_size
    }

    fn len(buf: &Option<Array>) -> i32 {
        buf.as_ref().map_or(0, |b| b.dim(2))
    }

    /// Rewrite `buf` into strict temporal order.
    fn temporal_order(&self, buf: &Array) -> Result<Array> {
        let len = buf.dim(2);
        if self.idx == len {
            Ok(buf.clone())
        } else if self.idx < self.offset {
            let newer = buf.index((.., .., self.idx.., ..));
            let older = buf.index((.., .., ..self.idx, ..));
            Ok(ops::concatenate_axis(&[&newer, &older], 2)?)
        } else {
            Ok(buf.index((.., .., ..self.idx, ..)))
        }
    }

    /// Prefill path: concatenate `t` new positions, bounded by the window.
    fn update_concat(&mut self, keys: Array, values: Array) -> Result<(Array, Array)> {
        let t = keys.dim(2);

        let (mut k, mut v) = match (self.keys.take(), self.values.take()) {
            (Some(old_k), Some(old_v)) => {
                let ordered_k = self.temporal_order(&old_k)?;
                let ordered_v = self.temporal_order(&old_v)?;
                let trim = ordered_k.dim(2) + t - self.max_size;
                let (ordered_k, ordered_v) = if trim > 0 {
                    (
                        ordered_k.index((.., .., trim.., ..)),
                        ordered_v.index((.., .., trim.., ..)),
                    )
                } else {
                    (ordered_k, ordered_v)
                };
                (
                    ops::concatenate_axis(&[&ordered_k, &keys], 2)?,
                    ops::concatenate_axis(&[&ordered_v, &values], 2)?,
                )
            }
            _ => (keys, values),
        };

        // A prefill longer than the window keeps only the trailing window.
        let overflow = k.dim(2) - self.max_size;
        if overflow > 0 {
            k = k.index((.., .., overflow.., ..));
            v = v.index((.., .., overflow.., ..));
        }

        self.idx = k.dim(2);
        self.offset += t;
        self.keys = Some(k.clone());
        self.values = Some(v.clone());
        Ok((k, v))
    }

    /// Decode path: write one position into the circular buffer.
    fn update_in_place(&mut self, keys: Array, values: Array) -> Result<(Array, Array)> {
        let len = Self::len(&self.keys);

        // Grow the allocation while the window is not yet full.
        if self.keys.is_none() || (self.idx >= len && len < self.max_size) {
            let grow = ALLOC_STEP.min(self.max_size - self.offset);
            let shape = keys.shape();
            let k_zeros =
                Array::zeros::<f32>(&[shape[0], shape[1], grow, shape[3]])?.as_dtype(keys.dtype())?;
            let v_shape = values.shape();
            let v_zeros = Array::zeros::<f32>(&[v_shape[0], v_shape[1], grow, v_shape[3]])?
                .as_dtype(values.dtype())?;
            match (self.keys.take(), self.values.take()) {
                (Some(k), Some(v)) => {
                    self.keys = Some(ops::concatenate_axis(&[&k, &k_zeros], 2)?);
                    self.values = Some(ops::concatenate_axis(&[&v, &v_zeros], 2)?);
                }
                _ => {
                    self.keys = Some(k_zeros);
                    self.values = Some(v_zeros);
                    self.idx = 0;
                }
            }
        }

        // Trim any excess over the window, then wrap the write head.
        let len = Self::len(&self.keys);
        if len > self.max_size {
            let trim = len - self.max_size;
            let k = self.keys.take().unwrap();
            let v = self.values.take().unwrap();
            self.keys = Some(k.index((.., .., trim.., ..)));
            self.values = Some(v.index((.., .., trim.., ..)));
            self.idx = self.max_size;
        }
        if self.idx == self.max_size {
            self.idx = 0;
        }

        let k_buf = self.keys.as_mut().unwrap();
        let v_buf = self.values.as_mut().unwrap();
        k_buf.index_mut((.., .., self.idx..self.idx + 1, ..), &keys);
        v_buf.index_mut((.., .., self.idx..self.idx + 1, ..), &values);
        self.offset += 1;
        self.idx += 1;

        if self.offset < self.max_size {
            Ok((
                k_buf.index((.., .., ..self.offset, ..)),
                v_buf.index((.., .., ..self.offset, ..)),
            ))
        } else {
            Ok((k_buf.clone(), v_buf.clone()))
        }
    }
}

impl KeyValueCache for RotatingKvCache {
    fn offset(&self) -> i32 {
        self.offset
    }

    fn update_and_fetch(&mut self, keys: Array, values: Array) -> Result<(Array, Array)> {
        if keys.dim(2) == 1 {
            self.update_in_place(keys, values)
        } else {
            self.update_concat(keys, values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::transforms::eval;

    fn kv(vals: &[f32]) -> (Array, Array) {
        let t = vals.len() as i32;
        let k = Array::from_slice(vals, &[1, 1, t, 1]);
        let scaled: Vec<f32> = vals.iter().map(|v| v * 10.0).collect();
        let v = Array::from_slice(&scaled, &[1, 1, t, 1]);
        (k, v)
    }

    fn flat(arr: &Array) -> Vec<f32> {
        let c = ops::contiguous(arr).unwrap();
        eval([&c]).unwrap();
        c.try_as_slice::<f32>().unwrap().to_vec()
    }

    #[test]
    fn single_token_updates_rotate_window() {
        let mut cache = RotatingKvCache::new(4);
        let mut last = None;
        for i in 1..=5 {
            let (k, v) = kv(&[i as f32]);
            last = Some(cache.update_and_fetch(k, v).unwrap());
        }
        let (k, v) = last.unwrap();
        assert_eq!(cache.offset(), 5);
        assert_eq!(flat(&k), vec![5.0, 2.0, 3.0, 4.0]);
        assert_eq!(flat(&v), vec![50.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn prefill_then_single_token_updates() {
        let mut cache = RotatingKvCache::new(4);
        let (k, v) = kv(&[1.0, 2.0, 3.0]);
        cache.update_and_fetch(k, v).unwrap();

        let (k, v) = kv(&[4.0]);
        cache.update_and_fetch(k, v).unwrap();
        let (k5, v5) = kv(&[5.0]);
        let (k, v) = cache.update_and_fetch(k5, v5).unwrap();

        assert_eq!(cache.offset(), 5);
        assert_eq!(flat(&k), vec![5.0, 2.0, 3.0, 4.0]);
        assert_eq!(flat(&v), vec![50.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn long_prefill_keeps_trailing_window() {
        let mut cache = RotatingKvCache::new(4);
        let vals: Vec<f32> = (1..=7).map(|i| i as f32).collect();
        let (k, v) = kv(&vals);
        let (k, _) = cache.update_and_fetch(k, v).unwrap();

        assert_eq!(cache.offset(), 7);
        assert_eq!(flat(&k), vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn growing_view_is_prefix_until_full() {
        let mut cache = RotatingKvCache::new(8);
        for i in 1..=3 {
            let (k, v) = kv(&[i as f32]);
            let (k, _) = cache.update_and_fetch(k, v).unwrap();
            assert_eq!(k.dim(2), i);
            assert_eq!(cache.offset(), i);
        }
    }

    #[test]
    fn prefill_decode_round_trip_orders_tail() {
        let mut cache = RotatingKvCache::new(4);
        let (k, v) = kv(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        cache.update_and_fetch(k, v).unwrap();
        for i in 6..=9 {
            let (k, v) = kv(&[i as f32]);
            cache.update_and_fetch(k, v).unwrap();
        }
        let (k10, v10) = kv(&[10.0]);
        let (k, _) = cache.update_and_fetch(k10, v10).unwrap();

        assert_eq!(cache.offset(), 10);
        // Temporal reinterpretation via idx: last 4 appended ids.
        let raw = flat(&k);
        let idx = 1usize; // only 10 written after the second wrap
        let mut ordered: Vec<f32> = raw[idx..].to_vec();
        ordered.extend_from_slice(&raw[..idx]);
        assert_eq!(ordered, vec![7.0, 8.0, 9.0, 10.0]);
    }
}
