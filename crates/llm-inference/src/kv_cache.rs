//! Per-core key/value cache.
//!
//! A core caches the kv heads it computes (see [`ShardLayout::kv_heads`])
//! for the positions it owns. Without sequence sharding that is every
//! position up to the capacity; with it, each replica of a kv head keeps a
//! contiguous chunk. Storage order follows the attention layout:
//!
//! - `BSH`: `[batch][position][head][dim]`
//! - `HSB`: `[head][position][batch][dim]`

use anyhow::{ensure, Result};
use ndarray::{ArrayView1, ArrayView2, ShapeBuilder};
use std::ops::Range;
use tpforge_config::AttentionLayout;
use tpforge_ir::ShardLayout;

#[derive(Debug, Clone)]
pub struct KvCache {
    layout: AttentionLayout,
    heads: Vec<usize>,
    owned: Range<usize>,
    batch: usize,
    head_dim: usize,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
}

impl KvCache {
    /// Cache for `core` sized for `capacity` positions per sequence.
    pub fn for_core(
        shard: &ShardLayout,
        attention_layout: AttentionLayout,
        core: usize,
        n_layers: usize,
        capacity: usize,
        batch: usize,
    ) -> Self {
        let heads = shard.kv_heads(core).to_vec();
        let replica = heads
            .first()
            .and_then(|&head| shard.replica_index(head, core))
            .unwrap_or(0);
        let owned = shard.sequence_chunk(capacity, replica);
        Self::new(attention_layout, heads, owned, batch, shard.head_dim, n_layers)
    }

    pub fn new(
        layout: AttentionLayout,
        heads: Vec<usize>,
        owned: Range<usize>,
        batch: usize,
        head_dim: usize,
        n_layers: usize,
    ) -> Self {
        let len = heads.len() * owned.len() * batch * head_dim;
        Self {
            layout,
            heads,
            owned,
            batch,
            head_dim,
            keys: vec![vec![0.0; len]; n_layers],
            values: vec![vec![0.0; len]; n_layers],
        }
    }

    pub fn heads(&self) -> &[usize] {
        &self.heads
    }

    /// Local slot of global kv head `head`.
    pub fn slot_of(&self, head: usize) -> Option<usize> {
        self.heads.iter().position(|&h| h == head)
    }

    pub fn owned(&self) -> Range<usize> {
        self.owned.clone()
    }

    pub fn owns(&self, position: usize) -> bool {
        self.owned.contains(&position)
    }

    pub fn num_bytes(&self, element_size: usize) -> u64 {
        (2 * self.keys.iter().map(Vec::len).sum::<usize>() * element_size) as u64
    }

    fn offset(&self, sequence: usize, slot: usize, position: usize) -> usize {
        let s = position - self.owned.start;
        let (h, len, b) = (self.heads.len(), self.owned.len(), self.batch);
        let index = match self.layout {
            AttentionLayout::Bsh => (sequence * len + s) * h + slot,
            AttentionLayout::Hsb => (slot * len + s) * b + sequence,
        };
        index * self.head_dim
    }

    /// Distance between consecutive positions of one head, in elements.
    fn position_stride(&self) -> usize {
        match self.layout {
            AttentionLayout::Bsh => self.heads.len() * self.head_dim,
            AttentionLayout::Hsb => self.batch * self.head_dim,
        }
    }

    pub fn write(
        &mut self,
        layer: usize,
        sequence: usize,
        slot: usize,
        position: usize,
        key: ArrayView1<'_, f32>,
        value: ArrayView1<'_, f32>,
    ) -> Result<()> {
        ensure!(
            self.owns(position),
            "position {} is outside the cached range {:?}",
            position,
            self.owned
        );
        ensure!(
            sequence < self.batch && slot < self.heads.len(),
            "cache slot ({}, {}) out of range",
            sequence,
            slot
        );
        ensure!(
            key.len() == self.head_dim && value.len() == self.head_dim,
            "kv rows must have head dim {}",
            self.head_dim
        );
        let at = self.offset(sequence, slot, position);
        let hd = self.head_dim;
        for (dst, src) in self.keys[layer][at..at + hd].iter_mut().zip(key.iter()) {
            *dst = *src;
        }
        for (dst, src) in self.values[layer][at..at + hd].iter_mut().zip(value.iter()) {
            *dst = *src;
        }
        Ok(())
    }

    /// Owned positions of `slot` strictly below `upto`, as strided views
    /// `(positions, head_dim)` into the cache storage.
    pub fn span(
        &self,
        layer: usize,
        sequence: usize,
        slot: usize,
        upto: usize,
    ) -> Result<(ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        let end = upto.min(self.owned.end);
        let len = end.saturating_sub(self.owned.start);
        if len == 0 {
            let empty = (0, self.head_dim);
            return Ok((
                ArrayView2::from_shape(empty, &[])?,
                ArrayView2::from_shape(empty, &[])?,
            ));
        }
        let start = self.offset(sequence, slot, self.owned.start);
        let stride = self.position_stride();
        Ok((
            strided(&self.keys[layer], start, len, self.head_dim, stride)?,
            strided(&self.values[layer], start, len, self.head_dim, stride)?,
        ))
    }

    pub fn reset(&mut self) {
        for buffer in self.keys.iter_mut().chain(self.values.iter_mut()) {
            buffer.fill(0.0);
        }
    }
}

fn strided(
    data: &[f32],
    start: usize,
    rows: usize,
    cols: usize,
    stride: usize,
) -> Result<ArrayView2<'_, f32>> {
    let extent = (rows - 1) * stride + cols;
    let shape = (rows, cols).strides((stride, 1));
    Ok(ArrayView2::from_shape(shape, &data[start..start + extent])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(layout: AttentionLayout) -> KvCache {
        let mut cache = KvCache::new(layout, vec![3, 5], 0..6, 2, 4, 1);
        for seq in 0..2 {
            for slot in 0..2 {
                for pos in 0..6 {
                    let base = (seq * 100 + slot * 10 + pos) as f32;
                    let key = [base, base + 0.1, base + 0.2, base + 0.3];
                    let value = key.map(|x| -x);
                    let (k, v) = (ArrayView1::from(&key[..]), ArrayView1::from(&value[..]));
                    cache.write(0, seq, slot, pos, k, v).unwrap();
                }
            }
        }
        cache
    }

    #[test]
    fn layouts_store_the_same_rows() {
        let bsh = filled(AttentionLayout::Bsh);
        let hsb = filled(AttentionLayout::Hsb);
        for seq in 0..2 {
            for slot in 0..2 {
                let (kb, vb) = bsh.span(0, seq, slot, 5).unwrap();
                let (kh, vh) = hsb.span(0, seq, slot, 5).unwrap();
                assert_eq!(kb, kh);
                assert_eq!(vb, vh);
                assert_eq!(kb.nrows(), 5);
                assert_eq!(kb[[4, 0]], (seq * 100 + slot * 10 + 4) as f32);
            }
        }
    }

    #[test]
    fn chunked_cache_only_accepts_owned_positions() {
        let mut cache = KvCache::new(AttentionLayout::Bsh, vec![0], 8..16, 1, 2, 1);
        let (k, v) = ([1.0, 2.0], [3.0, 4.0]);
        assert!(cache
            .write(0, 0, 0, 7, ArrayView1::from(&k[..]), ArrayView1::from(&v[..]))
            .is_err());
        cache
            .write(0, 0, 0, 8, ArrayView1::from(&k[..]), ArrayView1::from(&v[..]))
            .unwrap();
        assert_eq!(cache.span(0, 0, 0, 4).unwrap().0.nrows(), 0);
        assert_eq!(cache.span(0, 0, 0, 9).unwrap().0.nrows(), 1);
        assert_eq!(cache.span(0, 0, 0, 100).unwrap().0.nrows(), 8);
        assert_eq!(cache.slot_of(0), Some(0));
    }

    #[test]
    fn cache_size_counts_keys_and_values() {
        let cache = KvCache::new(AttentionLayout::Hsb, vec![0, 1], 0..128, 2, 8, 3);
        assert_eq!(cache.num_bytes(2), 2 * 3 * 2 * 128 * 2 * 8 * 2);
    }
}
