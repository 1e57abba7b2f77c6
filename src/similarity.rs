//! Embedding-based search, nearest files and file grouping.

use std::{collections::HashSet, path::Path, sync::Arc};

use tokio::{fs::File, io::AsyncReadExt, sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::{CacheManager, paths_digest},
    cluster,
    config::SimilarityConfig,
    embedding::Embedder,
    error::{Error, Result},
    record::SearchHit,
    vector_index::VectorIndex,
};

/// Parameters for [`SimilarityProvider::find_file_groups`]. Unset fields
/// fall back to the provider's [`SimilarityConfig`].
#[derive(Debug, Clone, Default)]
pub struct GroupRequest {
    /// Files to group; every path in the vector index when `None`.
    pub paths: Option<Vec<String>>,
    pub threshold: Option<f32>,
    pub min_group_size: Option<usize>,
    pub cancel: Option<CancellationToken>,
}

impl GroupRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn min_group_size(mut self, size: usize) -> Self {
        self.min_group_size = Some(size);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub struct SimilarityProvider {
    config: SimilarityConfig,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    cache: Arc<CacheManager>,
}

impl SimilarityProvider {
    pub fn new(
        config: SimilarityConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self {
            config,
            embedder,
            index,
            cache,
        }
    }

    /// Encode `text` on the blocking pool.
    pub async fn encode(&self, text: String) -> Result<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        tokio::task::spawn_blocking(move || embedder.encode(&text)).await?
    }

    async fn nearest(
        &self,
        vector: Vec<f32>,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let index = Arc::clone(&self.index);
        tokio::task::spawn_blocking(move || index.search(&vector, k)).await?
    }

    /// Indexed files whose vectors are similar to `query`, best first.
    ///
    /// Asks the vector index for twice `max_results` candidates so enough
    /// survive the threshold and `restrict_to` filters.
    pub async fn search(
        &self,
        query: &str,
        threshold: f32,
        max_results: usize,
        restrict_to: Option<&HashSet<String>>,
    ) -> Result<Vec<SearchHit>> {
        let restrict_key = restrict_to
            .map(|set| paths_digest(&set.iter().collect::<Vec<_>>()))
            .unwrap_or_else(|| "all".to_string());
        let key = format!(
            "similarity:search:{query}:{threshold}:{max_results}:{restrict_key}"
        );
        if let Some(cached) = self.cache.lookup::<Vec<SearchHit>>(&key) {
            return Ok(cached);
        }

        let vector = self.encode(query.to_string()).await?;
        let mut hits = self
            .nearest(vector, max_results.saturating_mul(2))
            .await?;
        hits.retain(|h| {
            h.score >= threshold
                && restrict_to.is_none_or(|set| set.contains(&h.path))
        });
        hits.truncate(max_results);

        self.cache.remember(&key, &hits);
        Ok(hits)
    }

    /// Indexed files most similar to the file at `path`, best first. The
    /// file itself is never part of the result.
    ///
    /// When the file cannot be read but a vector is already stored for it,
    /// that vector is used instead.
    pub async fn find_similar_files(
        &self,
        path: &str,
        threshold: f32,
        max_results: usize,
    ) -> Result<Vec<SearchHit>> {
        let key =
            format!("similarity:file:{path}:{threshold}:{max_results}");
        if let Some(cached) = self.cache.lookup::<Vec<SearchHit>>(&key) {
            return Ok(cached);
        }

        let vector = self.file_vector(path).await?;
        // One extra candidate, since the file usually finds itself.
        let mut hits =
            self.nearest(vector, max_results.saturating_add(1)).await?;
        hits.retain(|h| h.path != path && h.score >= threshold);
        hits.truncate(max_results);
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
        });

        self.cache.remember(&key, &hits);
        Ok(hits)
    }

    /// Cluster files into groups of mutually similar content.
    ///
    /// Files are read in batches of `encode_batch_size`, at most
    /// `encode_concurrency` at a time, and each batch is encoded with one
    /// [`Embedder::encode_batch`] call. Builds the full pairwise similarity
    /// matrix: O(n²) in the number of files. Groups and their members are
    /// sorted; files that cannot be read and have no stored vector are left
    /// out.
    pub async fn find_file_groups(
        &self,
        request: GroupRequest,
    ) -> Result<Vec<Vec<String>>> {
        let threshold =
            request.threshold.unwrap_or(self.config.group_threshold);
        let min_group_size = request
            .min_group_size
            .unwrap_or(self.config.min_group_size);
        let cancel = request.cancel.unwrap_or_default();

        let mut targets = match request.paths {
            Some(paths) => paths,
            None => self.index.paths()?,
        };
        targets.sort();
        targets.dedup();

        let key = format!(
            "similarity:groups:{}:{}:{threshold}:{min_group_size}",
            targets.len(),
            paths_digest(&targets)
        );
        if let Some(cached) = self.cache.lookup::<Vec<Vec<String>>>(&key) {
            return Ok(cached);
        }

        let mut encoded: Vec<(String, Vec<f32>)> =
            Vec::with_capacity(targets.len());
        let semaphore =
            Arc::new(Semaphore::new(self.config.encode_concurrency.max(1)));

        for batch in targets.chunks(self.config.encode_batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let texts = self.read_batch(batch, &semaphore).await;
            let mut readable = Vec::with_capacity(texts.len());
            for (path, text) in texts {
                match text {
                    Ok(text) => readable.push((path, text)),
                    Err(e) => match self.index.get(&path) {
                        Ok(Some(stored)) => {
                            debug!(path, error = %e, "using stored vector");
                            encoded.push((path, stored));
                        }
                        _ => debug!(path, error = %e, "leaving file out"),
                    },
                }
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if readable.is_empty() {
                continue;
            }

            let embedder = Arc::clone(&self.embedder);
            let vectors = tokio::task::spawn_blocking(move || {
                let vectors = {
                    let refs: Vec<&str> =
                        readable.iter().map(|(_, t)| t.as_str()).collect();
                    embedder.encode_batch(&refs)
                };
                vectors.map(|vectors| (readable, vectors))
            })
            .await?;
            match vectors {
                Ok((readable, vectors)) => encoded.extend(
                    readable.into_iter().map(|(path, _)| path).zip(vectors),
                ),
                Err(e) => warn!(error = %e, "batch encoding failed"),
            }
        }

        encoded.sort_by(|a, b| a.0.cmp(&b.0));
        let groups = tokio::task::spawn_blocking(move || {
            let (paths, vectors): (Vec<String>, Vec<Vec<f32>>) =
                encoded.into_iter().unzip();
            let labels = cluster::agglomerate(&vectors, threshold);
            cluster::groups_from_labels(&paths, &labels, min_group_size)
        })
        .await?;

        debug!(
            files = targets.len(),
            groups = groups.len(),
            "file grouping complete"
        );
        self.cache.remember(&key, &groups);
        Ok(groups)
    }

    /// Read every file in `batch` concurrently, bounded by `semaphore`.
    /// Results come back in completion order.
    async fn read_batch(
        &self,
        batch: &[String],
        semaphore: &Arc<Semaphore>,
    ) -> Vec<(String, Result<String>)> {
        let mut set = JoinSet::new();
        for path in batch {
            let path = path.clone();
            let semaphore = Arc::clone(semaphore);
            let max_bytes = self.config.max_read_bytes;
            set.spawn(async move {
                let text = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        read_capped(Path::new(&path), max_bytes).await
                    }
                    Err(_) => Err(Error::Cancelled),
                };
                (path, text)
            });
        }

        let mut texts = Vec::with_capacity(batch.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => texts.push(pair),
                Err(e) => warn!(error = %e, "file read task failed"),
            }
        }
        texts
    }

    async fn file_vector(&self, path: &str) -> Result<Vec<f32>> {
        encode_file(
            path,
            self.config.max_read_bytes,
            Arc::clone(&self.embedder),
            &self.index,
        )
        .await
    }
}

/// Read and encode the file at `path`, falling back to the vector stored
/// in `index` when the file is unreadable.
async fn encode_file(
    path: &str,
    max_bytes: usize,
    embedder: Arc<dyn Embedder>,
    index: &VectorIndex,
) -> Result<Vec<f32>> {
    match read_capped(Path::new(path), max_bytes).await {
        Ok(text) => {
            tokio::task::spawn_blocking(move || embedder.encode(&text)).await?
        }
        Err(e) => match index.get(path)? {
            Some(stored) => {
                debug!(
                    path,
                    error = %e,
                    "file unreadable, using stored vector"
                );
                Ok(stored)
            }
            None => Err(Error::NotFound {
                kind: "file",
                name: path.to_string(),
            }),
        },
    }
}

/// Read at most `max_bytes` of a file, decoding invalid UTF-8 lossily.
async fn read_capped(path: &Path, max_bytes: usize) -> Result<String> {
    let file = File::open(path).await?;
    let mut bytes = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
