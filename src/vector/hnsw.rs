//! Hierarchical Navigable Small World graph.
//!
//! Nodes live in an arena indexed by `u32`; per-layer neighbour lists
//! hold arena indexes, never references, so the naturally cyclic graph
//! needs no pointer juggling. Removal tombstones the node — searches
//! skip tombstoned results but still traverse their edges, keeping the
//! graph navigable.
//!
//! Insert draws the node's top layer from the geometric distribution
//! (`ℓ = ⌊−ln U · ml⌋`, `ml = 1/ln(2M)`), descends greedily to `ℓ+1`,
//! then at each layer below runs a best-first search of breadth
//! `ef_construction`, links up to `M` (`2M` at layer 0) nearest
//! neighbours bidirectionally, and prunes overfull neighbour lists back
//! to the cap keeping those nearest the owner.
//!
//! Search descends with breadth 1 to layer 1, then runs layer 0 with
//! breadth `max(ef_search, k)` and returns the top `k`.
//!
//! Level draws use a fixed seed so index builds are reproducible.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::encoding::{Decode, Encode};

use super::distance::{Dist, distance};
use super::{
    AnnIndex, IndexKind, Metric, Neighbor, VectorError, decode_f32_vec, encode_f32_vec,
};

const LEVEL_SEED: u64 = 0x6E65_7861_6462;

/// Tunables for graph construction and search.
#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Neighbours kept per node at layers above 0 (`M`); layer 0 keeps
    /// `2M`.
    pub m: usize,
    /// Search breadth while inserting.
    pub ef_construction: usize,
    /// Search breadth at layer 0 while querying (floored at `k`).
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 100,
        }
    }
}

struct Node {
    id: String,
    vector: Vec<f32>,
    /// Neighbour lists, one per layer `0..=node_level`.
    layers: Vec<Vec<u32>>,
    deleted: bool,
}

/// Approximate nearest-neighbour graph index. See the [module docs](self).
pub struct HnswIndex {
    dim: usize,
    metric: Metric,
    params: HnswParams,
    ml: f64,
    nodes: Vec<Node>,
    slots: HashMap<String, u32>,
    entry: Option<u32>,
    max_layer: usize,
    rng: StdRng,
    live: usize,
}

impl HnswIndex {
    /// Creates an empty graph for `dim`-length vectors.
    pub fn new(dim: usize, metric: Metric, params: HnswParams) -> Self {
        let ml = 1.0 / ((2 * params.m.max(1)) as f64).ln();
        Self {
            dim,
            metric,
            params,
            ml,
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry: None,
            max_layer: 0,
            rng: StdRng::seed_from_u64(LEVEL_SEED),
            live: 0,
        }
    }

    fn dist_to(&self, query: &[f32], node: u32) -> Dist {
        Dist(distance(self.metric, query, &self.nodes[node as usize].vector))
    }

    fn draw_level(&mut self) -> usize {
        let u: f64 = self.rng.random();
        let u = u.max(f64::MIN_POSITIVE);
        (-u.ln() * self.ml).floor() as usize
    }

    /// Single-candidate greedy descent within one layer.
    fn closest_at_layer(&self, query: &[f32], mut current: u32, layer: usize) -> u32 {
        let mut best = self.dist_to(query, current);
        loop {
            let mut improved = false;
            for &neighbor in &self.nodes[current as usize].layers[layer] {
                let d = self.dist_to(query, neighbor);
                if d < best {
                    best = d;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first search of breadth `ef` at one layer.
    ///
    /// Returns up to `ef` nodes ascending by distance. Tombstoned nodes
    /// are traversed and returned — callers filter where it matters.
    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, layer: usize) -> Vec<(Dist, u32)> {
        let ef = ef.max(1);
        let entry_dist = self.dist_to(query, entry);

        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);

        // Min-heap of live candidates, max-heap of current results.
        let mut candidates = BinaryHeap::new();
        candidates.push(Reverse((entry_dist, entry)));
        let mut results: BinaryHeap<(Dist, u32)> = BinaryHeap::new();
        results.push((entry_dist, entry));

        while let Some(Reverse((dist, node))) = candidates.pop() {
            if let Some(&(worst, _)) = results.peek()
                && results.len() >= ef
                && dist > worst
            {
                break;
            }

            for &neighbor in &self.nodes[node as usize].layers[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.dist_to(query, neighbor);
                let admit = match results.peek() {
                    Some(&(worst, _)) => results.len() < ef || d < worst,
                    None => true,
                };
                if admit {
                    candidates.push(Reverse((d, neighbor)));
                    results.push((d, neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Trims a node's neighbour list back to `cap`, keeping the entries
    /// nearest to the node itself.
    fn prune_neighbors(&mut self, node: u32, layer: usize, cap: usize) {
        let owner = self.nodes[node as usize].vector.clone();
        let mut list = std::mem::take(&mut self.nodes[node as usize].layers[layer]);
        list.sort_by_cached_key(|&n| self.dist_to(&owner, n));
        list.truncate(cap);
        self.nodes[node as usize].layers[layer] = list;
    }

    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            2 * self.params.m
        } else {
            self.params.m
        }
    }

    pub(crate) fn load_body(
        dim: usize,
        metric: Metric,
        params: &HnswParams,
        body: &[u8],
    ) -> Result<Self, VectorError> {
        let mut offset = 0;
        let (count, n) = u32::decode_from(&body[offset..])?;
        offset += n;

        let mut index = Self::new(dim, metric, params.clone());
        for _ in 0..count {
            let (id, n) = String::decode_from(&body[offset..])?;
            offset += n;
            let (deleted, n) = bool::decode_from(&body[offset..])?;
            offset += n;
            let (vector, n) = decode_f32_vec(&body[offset..])?;
            offset += n;
            if vector.len() != dim {
                return Err(VectorError::CorruptSnapshot(format!(
                    "node {id} has vector length {}, expected {dim}",
                    vector.len()
                )));
            }

            let (layer_count, n) = u32::decode_from(&body[offset..])?;
            offset += n;
            let mut layers = Vec::with_capacity(layer_count as usize);
            for _ in 0..layer_count {
                let (neighbors, n) = crate::encoding::decode_vec::<u32>(&body[offset..])?;
                offset += n;
                layers.push(neighbors);
            }

            let idx = index.nodes.len() as u32;
            index.slots.insert(id.clone(), idx);
            if !deleted {
                index.live += 1;
            }
            index.nodes.push(Node {
                id,
                vector,
                layers,
                deleted,
            });
        }

        let (entry, n) = Option::<u32>::decode_from(&body[offset..])?;
        offset += n;
        let (max_layer, _) = u32::decode_from(&body[offset..])?;

        index.entry = entry;
        index.max_layer = max_layer as usize;
        // Distinct draw stream per load point keeps rebuilds deterministic
        // without persisting RNG state.
        index.rng = StdRng::seed_from_u64(LEVEL_SEED.wrapping_add(index.nodes.len() as u64));
        Ok(index)
    }
}

impl AnnIndex for HnswIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
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

        // Replacing an id tombstones the old node; the fresh copy is
        // inserted like any other.
        if let Some(&old) = self.slots.get(id)
            && !self.nodes[old as usize].deleted
        {
            self.nodes[old as usize].deleted = true;
            self.live -= 1;
        }

        let level = self.draw_level();
        let idx = self.nodes.len() as u32;
        self.nodes.push(Node {
            id: id.to_string(),
            vector: vector.to_vec(),
            layers: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.slots.insert(id.to_string(), idx);
        self.live += 1;

        let Some(mut ep) = self.entry else {
            self.entry = Some(idx);
            self.max_layer = level;
            return Ok(());
        };

        let query = vector.to_vec();

        for layer in (level + 1..=self.max_layer).rev() {
            ep = self.closest_at_layer(&query, ep, layer);
        }

        for layer in (0..=level.min(self.max_layer)).rev() {
            let found = self.search_layer(&query, ep, self.params.ef_construction, layer);
            let cap = self.layer_cap(layer);

            let neighbors: Vec<u32> = found.iter().take(cap).map(|&(_, n)| n).collect();
            self.nodes[idx as usize].layers[layer] = neighbors.clone();

            for &neighbor in &neighbors {
                self.nodes[neighbor as usize].layers[layer].push(idx);
                if self.nodes[neighbor as usize].layers[layer].len() > cap {
                    self.prune_neighbors(neighbor, layer, cap);
                }
            }

            if let Some(&(_, nearest)) = found.first() {
                ep = nearest;
            }
        }

        if level > self.max_layer {
            self.entry = Some(idx);
            self.max_layer = level;
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.slots.get(id) {
            Some(&idx) if !self.nodes[idx as usize].deleted => {
                self.nodes[idx as usize].deleted = true;
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
        let Some(mut ep) = self.entry else {
            return Ok(Vec::new());
        };
        if self.live == 0 || k == 0 {
            return Ok(Vec::new());
        }

        for layer in (1..=self.max_layer).rev() {
            ep = self.closest_at_layer(query, ep, layer);
        }

        let ef = self.params.ef_search.max(k);
        let found = self.search_layer(query, ep, ef, 0);

        Ok(found
            .into_iter()
            .filter(|&(_, n)| !self.nodes[n as usize].deleted)
            .take(k)
            .map(|(dist, n)| Neighbor {
                id: self.nodes[n as usize].id.clone(),
                distance: dist.0,
            })
            .collect())
    }

    fn save_body(&self, buf: &mut Vec<u8>) -> Result<(), VectorError> {
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for node in &self.nodes {
            node.id.encode_to(buf)?;
            node.deleted.encode_to(buf)?;
            encode_f32_vec(&node.vector, buf);
            buf.extend_from_slice(&(node.layers.len() as u32).to_le_bytes());
            for layer in &node.layers {
                crate::encoding::encode_vec(layer, buf)?;
            }
        }
        self.entry.encode_to(buf)?;
        (self.max_layer as u32).encode_to(buf)?;
        Ok(())
    }
}
