//! Brute-force exact index: a flat row-major array scanned per query.

use std::collections::HashMap;

use crate::encoding::Decode;

use super::distance::{Dist, distance};
use super::{
    AnnIndex, IndexKind, Metric, Neighbor, VectorError, decode_f32_vec, encode_f32_vec,
};

/// Exact nearest-neighbour index. `O(n·d)` per query, zero build cost —
/// the baseline the HNSW variant is measured against.
pub struct BruteForceIndex {
    dim: usize,
    metric: Metric,
    ids: Vec<String>,
    /// Row-major `n·dim` storage; row `i` belongs to `ids[i]`.
    data: Vec<f32>,
    deleted: Vec<bool>,
    slots: HashMap<String, usize>,
    live: usize,
}

impl BruteForceIndex {
    /// Creates an empty index for `dim`-length vectors.
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            ids: Vec::new(),
            data: Vec::new(),
            deleted: Vec::new(),
            slots: HashMap::new(),
            live: 0,
        }
    }

    fn row(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    pub(crate) fn load_body(
        dim: usize,
        metric: Metric,
        body: &[u8],
    ) -> Result<Self, VectorError> {
        let mut offset = 0;

        let (count, n) = u32::decode_from(&body[offset..])?;
        offset += n;

        let mut index = Self::new(dim, metric);
        for _ in 0..count {
            let (id, n) = String::decode_from(&body[offset..])?;
            offset += n;
            let (deleted, n) = bool::decode_from(&body[offset..])?;
            offset += n;
            let (vector, n) = decode_f32_vec(&body[offset..])?;
            offset += n;

            if vector.len() != dim {
                return Err(VectorError::CorruptSnapshot(format!(
                    "row for {id} has length {}, expected {dim}",
                    vector.len()
                )));
            }

            let slot = index.ids.len();
            index.slots.insert(id.clone(), slot);
            index.ids.push(id);
            index.data.extend_from_slice(&vector);
            index.deleted.push(deleted);
            if !deleted {
                index.live += 1;
            }
        }
        Ok(index)
    }
}

impl AnnIndex for BruteForceIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn kind(&self) -> IndexKind {
        IndexKind::BruteForce
    }

    fn len(&self) -> usize {
        self.live
    }

    fn metric(&self) -> Metric {
        self.metric
    }

    fn add(&mut self, id: &str, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        if let Some(&slot) = self.slots.get(id) {
            self.data[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(vector);
            if self.deleted[slot] {
                self.deleted[slot] = false;
                self.live += 1;
            }
            return Ok(());
        }

        let slot = self.ids.len();
        self.ids.push(id.to_string());
        self.data.extend_from_slice(vector);
        self.deleted.push(false);
        self.slots.insert(id.to_string(), slot);
        self.live += 1;
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.slots.get(id) {
            Some(&slot) if !self.deleted[slot] => {
                self.deleted[slot] = true;
                self.live -= 1;
                true
            }
            _ => false,
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, VectorError> {
        if query.len() != self.dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if self.live == 0 || k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<(Dist, usize)> = (0..self.ids.len())
            .filter(|&slot| !self.deleted[slot])
            .map(|slot| (Dist(distance(self.metric, query, self.row(slot))), slot))
            .collect();

        // Partial sort: place the top-k, then order just that prefix.
        let k = k.min(hits.len());
        if k < hits.len() {
            hits.select_nth_unstable(k - 1);
            hits.truncate(k);
        }
        hits.sort_unstable();

        Ok(hits
            .into_iter()
            .map(|(dist, slot)| Neighbor {
                id: self.ids[slot].clone(),
                distance: dist.0,
            })
            .collect())
    }

    fn save_body(&self, buf: &mut Vec<u8>) -> Result<(), VectorError> {
        buf.extend_from_slice(&(self.ids.len() as u32).to_le_bytes());
        for slot in 0..self.ids.len() {
            crate::encoding::Encode::encode_to(&self.ids[slot], buf)?;
            crate::encoding::Encode::encode_to(&self.deleted[slot], buf)?;
            encode_f32_vec(self.row(slot), buf);
        }
        Ok(())
    }
}
