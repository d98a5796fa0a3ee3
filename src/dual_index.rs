// Embedded Dual Index
// One logical index per knowledge base exposing a dense-kNN view (cosine
// similarity) and a BM25 inverted view over the same entries. Shards persist
// as bincode snapshots and reload on open, so the index survives restarts.

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task;
use tracing::{debug, info};
use uuid::Uuid;

use crate::contracts::{DualIndex, IndexEntry, IndexFilter, IndexHit};

const AUTO_FLUSH_THRESHOLD: usize = 32;

// Okapi BM25 parameters
const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Tokenize text for the BM25 view: ASCII/alphabetic runs are lowercased
/// word tokens, CJK ideographs contribute overlapping bigrams (and the
/// single character when it stands alone). Both queries and documents go
/// through this analyzer, so CJK text matches without whitespace.
pub fn cjk_tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    fn flush_word(word: &mut String, tokens: &mut Vec<String>) {
        if !word.is_empty() {
            tokens.push(std::mem::take(word).to_lowercase());
        }
    }

    fn flush_cjk(run: &mut Vec<char>, tokens: &mut Vec<String>) {
        match run.len() {
            0 => {}
            1 => tokens.push(run[0].to_string()),
            _ => {
                for pair in run.windows(2) {
                    tokens.push(pair.iter().collect());
                }
            }
        }
        run.clear();
    }

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut tokens);
            cjk_run.push(c);
        } else {
            flush_cjk(&mut cjk_run, &mut tokens);
            if c.is_alphanumeric() {
                word.push(c);
            } else {
                flush_word(&mut word, &mut tokens);
            }
        }
    }
    flush_cjk(&mut cjk_run, &mut tokens);
    flush_word(&mut word, &mut tokens);

    tokens
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK Unified Ideographs
        | 0x3400..=0x4DBF    // Extension A
        | 0x3040..=0x30FF    // Hiragana + Katakana
        | 0xAC00..=0xD7AF    // Hangul syllables
    )
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    text: String,
    vector: Vec<f32>,
    metadata: crate::contracts::ChunkMetadata,
    token_count: u32,
}

/// One logical index: entries plus the inverted postings derived from them.
#[derive(Debug, Serialize, Deserialize)]
struct Shard {
    dim: usize,
    entries: HashMap<String, StoredEntry>,
    /// term -> entry id -> term frequency
    postings: HashMap<String, HashMap<String, u32>>,
    total_tokens: u64,
    #[serde(skip)]
    pending_writes: usize,
}

impl Shard {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: HashMap::new(),
            postings: HashMap::new(),
            total_tokens: 0,
            pending_writes: 0,
        }
    }

    fn insert(&mut self, id: String, entry: IndexEntry) {
        let tokens = cjk_tokenize(&entry.text);
        let token_count = tokens.len() as u32;

        let mut freqs: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *freqs.entry(token).or_insert(0) += 1;
        }
        for (term, tf) in freqs {
            self.postings.entry(term).or_default().insert(id.clone(), tf);
        }
        self.total_tokens += token_count as u64;

        self.entries.insert(
            id,
            StoredEntry {
                text: entry.text,
                vector: entry.vector,
                metadata: entry.metadata,
                token_count,
            },
        );
    }

    fn remove(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            self.total_tokens = self.total_tokens.saturating_sub(entry.token_count as u64);
            self.postings.retain(|_, ids| {
                ids.remove(id);
                !ids.is_empty()
            });
        }
    }

    fn avg_doc_len(&self) -> f32 {
        if self.entries.is_empty() {
            0.0
        } else {
            self.total_tokens as f32 / self.entries.len() as f32
        }
    }

    fn knn(&self, vector: &[f32], filter: Option<&IndexFilter>) -> Vec<IndexHit> {
        self.entries
            .iter()
            .filter(|(_, e)| filter.map(|f| f.matches(&e.metadata)).unwrap_or(true))
            .map(|(id, e)| IndexHit {
                id: id.clone(),
                text: e.text.clone(),
                score: cosine_similarity(vector, &e.vector),
                metadata: e.metadata.clone(),
            })
            .collect()
    }

    fn bm25(&self, query: &str, filter: Option<&IndexFilter>) -> Vec<IndexHit> {
        let query_terms = cjk_tokenize(query);
        if query_terms.is_empty() || self.entries.is_empty() {
            return Vec::new();
        }

        let n = self.entries.len() as f32;
        let avgdl = self.avg_doc_len().max(1.0);
        let mut scores: HashMap<&str, f32> = HashMap::new();

        for term in &query_terms {
            let Some(ids) = self.postings.get(term) else {
                continue;
            };
            let df = ids.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (id, tf) in ids {
                let entry = &self.entries[id];
                let tf = *tf as f32;
                let dl = entry.token_count as f32;
                let norm = tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl));
                *scores.entry(id.as_str()).or_insert(0.0) += idf * norm;
            }
        }

        scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .filter_map(|(id, score)| {
                let entry = &self.entries[id];
                if filter.map(|f| f.matches(&entry.metadata)).unwrap_or(true) {
                    Some(IndexHit {
                        id: id.to_string(),
                        text: entry.text.clone(),
                        score,
                        metadata: entry.metadata.clone(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Embedded dual-index engine persisting one snapshot file per logical index.
pub struct EmbeddedDualIndex {
    root: PathBuf,
    shards: RwLock<HashMap<String, Shard>>,
}

impl EmbeddedDualIndex {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create index root: {}", root.display()))?;

        let mut shards = HashMap::new();
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(dir_entry) = dir.next_entry().await? {
            let path = dir_entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("idx") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            let shard = task::spawn_blocking(move || -> Result<Shard> {
                let file = File::open(&path)
                    .with_context(|| format!("Failed to open shard: {}", path.display()))?;
                Ok(bincode::deserialize_from(BufReader::new(file))?)
            })
            .await??;
            shards.insert(name, shard);
        }

        if !shards.is_empty() {
            info!(count = shards.len(), "Loaded index shards from disk");
        }

        Ok(Self {
            root,
            shards: RwLock::new(shards),
        })
    }

    fn shard_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.idx"))
    }

    async fn persist_shard(&self, name: &str, shard: &Shard) -> Result<()> {
        let path = self.shard_path(name);
        let snapshot = bincode::serialize(shard)?;
        task::spawn_blocking(move || -> Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            let mut writer = BufWriter::new(file);
            std::io::Write::write_all(&mut writer, &snapshot)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn maybe_persist(&self, name: &str, shard: &mut Shard) -> Result<()> {
        if shard.pending_writes >= AUTO_FLUSH_THRESHOLD {
            self.persist_shard(name, shard).await?;
            shard.pending_writes = 0;
        }
        Ok(())
    }

    /// Force all shards to disk.
    pub async fn flush(&self) -> Result<()> {
        let mut shards = self.shards.write().await;
        for (name, shard) in shards.iter_mut() {
            if shard.pending_writes > 0 {
                self.persist_shard(name, shard).await?;
                shard.pending_writes = 0;
            }
        }
        Ok(())
    }

    async fn search_merge<F>(&self, names: &[String], k: usize, per_shard: F) -> Result<Vec<IndexHit>>
    where
        F: Fn(&Shard) -> Vec<IndexHit>,
    {
        let shards = self.shards.read().await;
        let mut hits = Vec::new();
        for name in names {
            let shard = shards
                .get(name)
                .ok_or_else(|| anyhow!("Unknown index: {name}"))?;
            hits.extend(per_shard(shard));
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

#[async_trait]
impl DualIndex for EmbeddedDualIndex {
    async fn ensure_index(&self, name: &str, dim: usize) -> Result<()> {
        ensure!(dim > 0, "Vector dimension must be positive");
        let mut shards = self.shards.write().await;
        if let Some(existing) = shards.get(name) {
            ensure!(
                existing.dim == dim,
                "Index {name} already exists with dimension {} (requested {dim})",
                existing.dim
            );
            return Ok(());
        }
        let shard = Shard::new(dim);
        self.persist_shard(name, &shard).await?;
        shards.insert(name.to_string(), shard);
        debug!(index = name, dim, "Index created");
        Ok(())
    }

    async fn bulk_upsert(&self, name: &str, entries: Vec<IndexEntry>) -> Result<Vec<String>> {
        let mut shards = self.shards.write().await;
        let shard = shards
            .get_mut(name)
            .ok_or_else(|| anyhow!("Unknown index: {name}"))?;

        // Validate the whole batch before touching the shard so a bad entry
        // leaves the index unchanged (all-or-nothing per batch).
        for (i, entry) in entries.iter().enumerate() {
            ensure!(
                entry.vector.len() == shard.dim,
                "Entry {i}: vector dimension mismatch, expected {}, got {}",
                shard.dim,
                entry.vector.len()
            );
            ensure!(!entry.text.is_empty(), "Entry {i}: text cannot be empty");
        }

        let mut ids = Vec::with_capacity(entries.len());
        let count = entries.len();
        for entry in entries {
            let id = Uuid::new_v4().to_string();
            shard.insert(id.clone(), entry);
            ids.push(id);
        }
        shard.pending_writes += count;
        self.maybe_persist(name, shard).await?;

        debug!(index = name, count, "Bulk upsert applied");
        Ok(ids)
    }

    async fn delete_by_filter(&self, name: &str, filter: &IndexFilter) -> Result<usize> {
        let mut shards = self.shards.write().await;
        let shard = shards
            .get_mut(name)
            .ok_or_else(|| anyhow!("Unknown index: {name}"))?;

        let doomed: Vec<String> = shard
            .entries
            .iter()
            .filter(|(_, e)| filter.matches(&e.metadata))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            shard.remove(id);
        }
        let removed = doomed.len();
        if removed > 0 {
            shard.pending_writes += removed;
            self.maybe_persist(name, shard).await?;
        }
        Ok(removed)
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        let mut shards = self.shards.write().await;
        shards.remove(name);
        let path = self.shard_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to drop index file: {name}")),
        }
    }

    async fn knn(
        &self,
        names: &[String],
        vector: &[f32],
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>> {
        {
            let shards = self.shards.read().await;
            for name in names {
                let shard = shards
                    .get(name)
                    .ok_or_else(|| anyhow!("Unknown index: {name}"))?;
                ensure!(
                    shard.dim == vector.len(),
                    "Query vector dimension mismatch for {name}: expected {}, got {}",
                    shard.dim,
                    vector.len()
                );
            }
        }
        self.search_merge(names, k, |shard| shard.knn(vector, filter))
            .await
    }

    async fn bm25(
        &self,
        names: &[String],
        query: &str,
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>> {
        self.search_merge(names, k, |shard| shard.bm25(query, filter))
            .await
    }
}

/// Production factory for the embedded dual index.
pub async fn create_dual_index(root: impl AsRef<Path>) -> Result<Arc<dyn DualIndex>> {
    Ok(Arc::new(EmbeddedDualIndex::open(root).await?))
}
