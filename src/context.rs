use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cache::CacheManager,
    config::SearchConfig,
    data_dir::DataDir,
    embedding::{Embedder, HashingEmbedder},
    error::{Error, Result},
};

/// Process-wide state shared by every component: configuration, the data
/// directory, the result cache, the embedding model and a root
/// cancellation token.
///
/// Build one at startup and hand it to
/// [`IndexCoordinator::open`](crate::IndexCoordinator::open). Cloning is
/// cheap; clones share the cache, the embedder and the token.
#[derive(Clone)]
pub struct AppContext {
    pub config: SearchConfig,
    pub data_dir: DataDir,
    pub cache: Arc<CacheManager>,
    pub embedder: Arc<dyn Embedder>,
    shutdown: CancellationToken,
}

impl AppContext {
    /// Load `config.json` from the data directory (or use defaults) and
    /// build the context with the built-in hashing embedder.
    pub fn open(data_dir: DataDir) -> Result<Self> {
        let config = SearchConfig::load(&data_dir.config_file())?;
        Self::with_config(data_dir, config)
    }

    pub fn with_config(
        data_dir: DataDir,
        config: SearchConfig,
    ) -> Result<Self> {
        config.validate()?;
        let cache = CacheManager::new(
            &data_dir.cache_dir()?,
            config.cache.max_items,
            config.cache.ttl(),
        )?;
        let embedder: Arc<dyn Embedder> =
            Arc::new(HashingEmbedder::new(config.embedding_dimension));
        debug!(root = %data_dir.root().display(), "application context ready");

        Ok(Self {
            config,
            data_dir,
            cache: Arc::new(cache),
            embedder,
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the embedding model.
    ///
    /// The vector index is opened with the embedder's dimension, so this
    /// must happen before the coordinator is opened. Vectors persisted with
    /// another dimension are ignored on load.
    pub fn with_embedder(
        mut self,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        if embedder.dimension() == 0 {
            return Err(Error::Config("embedder reports dimension 0".into()));
        }
        self.embedder = embedder;
        Ok(self)
    }

    /// A token that is cancelled when the context shuts down, and can also
    /// be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("data_dir", &self.data_dir)
            .field("embedding_dimension", &self.embedder.dimension())
            .finish_non_exhaustive()
    }
}
