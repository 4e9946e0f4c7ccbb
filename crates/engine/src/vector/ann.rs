//! The ANN engine seam.
//!
//! The domain is written against [`AnnIndex`] so a native HNSW library can
//! be slotted in without touching the staging or checkpoint protocol.
//! [`BruteForceIndex`] is the built-in implementation: exact O(n) search
//! with a deterministic key-ascending tie-break, which keeps every test
//! reproducible.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use cairn_core::{Error, Result};
use serde::{Deserialize, Serialize};

const SAVE_MAGIC: &[u8; 8] = b"CAIRNANN";
const SAVE_VERSION: u32 = 1;

/// Distance metric for similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
    InnerProduct,
}

/// Element type vectors are quantized to at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScalarKind {
    #[default]
    F32,
    F64,
    I8,
}

impl ScalarKind {
    pub(crate) fn wire_code(self) -> u8 {
        match self {
            ScalarKind::F32 => 1,
            ScalarKind::F64 => 2,
            ScalarKind::I8 => 3,
        }
    }

    pub(crate) fn from_wire_code(code: u8) -> Option<ScalarKind> {
        match code {
            1 => Some(ScalarKind::F32),
            2 => Some(ScalarKind::F64),
            3 => Some(ScalarKind::I8),
            _ => None,
        }
    }
}

/// Configuration an index is initialized with. Stored durably per domain;
/// the first stored value wins for the domain's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnInitOptions {
    pub metric: Metric,
    pub quantization: ScalarKind,
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
    /// Allow multiple vectors per key.
    pub multi: bool,
}

impl AnnInitOptions {
    pub fn new(dimensions: usize) -> AnnInitOptions {
        AnnInitOptions {
            metric: Metric::default(),
            quantization: ScalarKind::default(),
            dimensions,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        }
    }
}

/// The index surface the vector domain consumes.
pub trait AnnIndex: Send {
    /// Insert a new vector. Re-adding a present key is an error unless the
    /// index was initialized with `multi`.
    fn add(&mut self, key: u64, vector: &[f32]) -> Result<()>;
    /// Insert or overwrite, regardless of `multi`.
    fn replace(&mut self, key: u64, vector: &[f32]) -> Result<()>;
    fn remove(&mut self, key: u64) -> Result<bool>;
    fn contains(&self, key: u64) -> bool;
    fn get(&self, key: u64) -> Option<Vec<f32>>;
    /// Top-`k` nearest keys with their distances, nearest first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn dimensions(&self) -> usize;
    /// Serialize the whole index into one buffer.
    fn save_buffer(&self) -> Result<Vec<u8>>;
    /// Replace the index contents from a buffer produced by `save_buffer`.
    fn load_buffer(&mut self, buf: &[u8]) -> Result<()>;
}

/// Creates index instances for a domain's stored options.
pub trait AnnFactory: Send + Sync {
    fn create(&self, options: &AnnInitOptions) -> Result<Box<dyn AnnIndex>>;
}

/// Factory for the built-in exact index.
#[derive(Debug, Clone, Copy, Default)]
pub struct BruteForceFactory;

impl AnnFactory for BruteForceFactory {
    fn create(&self, options: &AnnInitOptions) -> Result<Box<dyn AnnIndex>> {
        Ok(Box::new(BruteForceIndex::new(options.clone())))
    }
}

/// Exact nearest-neighbor index over a `BTreeMap`.
pub struct BruteForceIndex {
    options: AnnInitOptions,
    vectors: BTreeMap<u64, Vec<f32>>,
}

impl BruteForceIndex {
    pub fn new(options: AnnInitOptions) -> BruteForceIndex {
        BruteForceIndex {
            options,
            vectors: BTreeMap::new(),
        }
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.options.metric {
            Metric::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
            Metric::InnerProduct => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
            Metric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (na * nb)
                }
            }
        }
    }

    fn check_dims(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.options.dimensions {
            return Err(Error::config(format!(
                "vector has {} dimensions, index expects {}",
                vector.len(),
                self.options.dimensions
            )));
        }
        Ok(())
    }
}

impl AnnIndex for BruteForceIndex {
    fn add(&mut self, key: u64, vector: &[f32]) -> Result<()> {
        self.check_dims(vector)?;
        if !self.options.multi && self.vectors.contains_key(&key) {
            return Err(Error::invalid(format!(
                "key {key} is already present; replace it instead"
            )));
        }
        self.vectors.insert(key, vector.to_vec());
        Ok(())
    }

    fn replace(&mut self, key: u64, vector: &[f32]) -> Result<()> {
        self.check_dims(vector)?;
        self.vectors.insert(key, vector.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: u64) -> Result<bool> {
        Ok(self.vectors.remove(&key).is_some())
    }

    fn contains(&self, key: u64) -> bool {
        self.vectors.contains_key(&key)
    }

    fn get(&self, key: u64) -> Option<Vec<f32>> {
        self.vectors.get(&key).cloned()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        self.check_dims(query)?;
        let mut scored: Vec<(u64, f32)> = self
            .vectors
            .iter()
            .map(|(key, v)| (*key, self.distance(query, v)))
            .collect();
        // Ties broken by ascending key; BTreeMap iteration already yields
        // keys ascending, and the sort is stable.
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn dimensions(&self) -> usize {
        self.options.dimensions
    }

    fn save_buffer(&self) -> Result<Vec<u8>> {
        let dims = self.options.dimensions;
        let mut body = Vec::with_capacity(self.vectors.len() * (8 + dims * 4));
        for (key, vector) in &self.vectors {
            let mut kbuf = [0u8; 8];
            BigEndian::write_u64(&mut kbuf, *key);
            body.extend_from_slice(&kbuf);
            let mut vbuf = vec![0u8; dims * 4];
            LittleEndian::write_f32_into(vector, &mut vbuf);
            body.extend_from_slice(&vbuf);
        }
        let mut out = Vec::with_capacity(24 + body.len());
        out.extend_from_slice(SAVE_MAGIC);
        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, SAVE_VERSION);
        out.extend_from_slice(&word);
        BigEndian::write_u32(&mut word, dims as u32);
        out.extend_from_slice(&word);
        let mut count = [0u8; 8];
        BigEndian::write_u64(&mut count, self.vectors.len() as u64);
        out.extend_from_slice(&count);
        BigEndian::write_u32(&mut word, crc32fast::hash(&body));
        out.extend_from_slice(&word);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn load_buffer(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() < 28 || &buf[0..8] != SAVE_MAGIC {
            return Err(Error::corruption("index snapshot has wrong magic"));
        }
        let version = BigEndian::read_u32(&buf[8..12]);
        if version != SAVE_VERSION {
            return Err(Error::corruption(format!(
                "index snapshot version {version} unsupported"
            )));
        }
        let dims = BigEndian::read_u32(&buf[12..16]) as usize;
        if dims != self.options.dimensions {
            return Err(Error::config(format!(
                "snapshot has {} dimensions, index expects {}",
                dims, self.options.dimensions
            )));
        }
        let count = BigEndian::read_u64(&buf[16..24]) as usize;
        let expected_crc = BigEndian::read_u32(&buf[24..28]);
        let body = &buf[28..];
        if crc32fast::hash(body) != expected_crc {
            return Err(Error::corruption("index snapshot checksum mismatch"));
        }
        let record = 8 + dims * 4;
        if body.len() != count * record {
            return Err(Error::corruption("index snapshot is truncated"));
        }
        let mut vectors = BTreeMap::new();
        for chunk in body.chunks_exact(record) {
            let key = BigEndian::read_u64(&chunk[0..8]);
            let mut vector = vec![0f32; dims];
            LittleEndian::read_f32_into(&chunk[8..], &mut vector);
            vectors.insert(key, vector);
        }
        self.vectors = vectors;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> BruteForceIndex {
        BruteForceIndex::new(AnnInitOptions::new(4))
    }

    #[test]
    fn add_get_remove() {
        let mut idx = index();
        idx.add(7, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(idx.contains(7));
        assert_eq!(idx.get(7).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
        assert!(idx.remove(7).unwrap());
        assert!(!idx.remove(7).unwrap());
        assert!(idx.is_empty());
    }

    #[test]
    fn duplicate_add_is_rejected_replace_overwrites() {
        let mut idx = index();
        idx.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(matches!(
            idx.add(1, &[0.0, 1.0, 0.0, 0.0]),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(idx.get(1).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
        idx.replace(1, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(idx.get(1).unwrap(), vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(idx.len(), 1);
        // Replace also inserts when the key is absent.
        idx.replace(2, &[0.5, 0.5, 0.0, 0.0]).unwrap();
        assert!(idx.contains(2));
    }

    #[test]
    fn multi_index_tolerates_repeated_adds() {
        let mut idx = BruteForceIndex::new(AnnInitOptions {
            multi: true,
            ..AnnInitOptions::new(4)
        });
        idx.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        idx.add(1, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert!(idx.contains(1));
    }

    #[test]
    fn dimension_mismatch_is_config_error() {
        let mut idx = index();
        assert!(matches!(
            idx.add(1, &[1.0, 2.0]),
            Err(Error::Config(_))
        ));
        assert!(matches!(idx.search(&[1.0], 1), Err(Error::Config(_))));
    }

    #[test]
    fn search_orders_by_distance_then_key() {
        let mut idx = index();
        idx.add(3, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        idx.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        idx.add(2, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        let hits = idx.search(&[1.0, 0.0, 0.0, 0.0], 3).unwrap();
        let keys: Vec<u64> = hits.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert!(hits[0].1 <= hits[2].1);
    }

    #[test]
    fn euclidean_prefers_closer_point() {
        let mut idx = BruteForceIndex::new(AnnInitOptions {
            metric: Metric::Euclidean,
            ..AnnInitOptions::new(2)
        });
        idx.add(10, &[0.0, 0.0]).unwrap();
        idx.add(20, &[5.0, 5.0]).unwrap();
        let hits = idx.search(&[0.5, 0.5], 1).unwrap();
        assert_eq!(hits[0].0, 10);
    }

    #[test]
    fn save_load_round_trip() {
        let mut idx = index();
        for k in 0..50u64 {
            idx.add(k, &[k as f32, 1.0, 2.0, 3.0]).unwrap();
        }
        let buf = idx.save_buffer().unwrap();
        let mut restored = index();
        restored.load_buffer(&buf).unwrap();
        assert_eq!(restored.len(), 50);
        assert_eq!(restored.get(13).unwrap()[0], 13.0);
    }

    #[test]
    fn corrupted_snapshot_is_rejected() {
        let mut idx = index();
        idx.add(1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut buf = idx.save_buffer().unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            index().load_buffer(&buf),
            Err(Error::Corruption(_))
        ));
    }
}
