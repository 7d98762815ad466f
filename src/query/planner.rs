//! Maps queries onto storage and embedding calls.

use std::path::Path;
use std::sync::Arc;

use serde_json::Map;

use super::{FileDocument, IndexStats, Query, QueryResponse, SearchHit};
use crate::config::{Config, KeywordMode};
use crate::embeddings::EmbeddingService;
use crate::error::QueryError;
use crate::indexer::assemble;
use crate::server::metrics;
use crate::storage::{ChunkFilter, ChunkStore};
use crate::watcher::normalize;
use crate::Result;

/// Chunk metadata keys that describe a single chunk rather than its file.
const CHUNK_ONLY_KEYS: &[&str] = &["lines"];

/// Executes [`Query`] values. Cheap to clone.
#[derive(Clone)]
pub struct QueryPlanner {
    store: Arc<dyn ChunkStore>,
    embedder: EmbeddingService,
    keyword_mode: KeywordMode,
    max_limit: usize,
}

impl QueryPlanner {
    /// Create a planner. Limits above `max_limit` are clamped.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: EmbeddingService,
        keyword_mode: KeywordMode,
        max_limit: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            keyword_mode,
            max_limit: max_limit.max(1),
        }
    }

    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &Config, store: Arc<dyn ChunkStore>, embedder: EmbeddingService) -> Self {
        Self::new(store, embedder, config.keyword_mode, config.max_query_limit)
    }

    /// The store queries run against.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Run any query and record its latency.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidQuery`] for malformed input,
    /// [`QueryError::NotFound`] for an unindexed exact path, or the
    /// storage or embedding error that stopped the query.
    pub async fn execute(&self, query: Query) -> Result<QueryResponse> {
        let kind = query.kind();
        let timer = metrics::QUERY_LATENCY.with_label_values(&[kind]).start_timer();

        let result = match query {
            Query::Semantic {
                text,
                limit,
                filetype,
                directory,
            } => self
                .semantic(&text, limit, filetype.as_deref(), directory.as_deref())
                .await
                .map(QueryResponse::Hits),
            Query::Keyword { terms, limit, mode } => {
                self.keyword(&terms, limit, mode).map(QueryResponse::Hits)
            }
            Query::ExactPath { path } => self.exact_path(&path).map(QueryResponse::File),
            Query::List { limit } => self.list(limit).map(QueryResponse::Files),
            Query::Stats => self.stats().map(QueryResponse::Stats),
        };

        timer.observe_duration();
        if let Err(e) = &result {
            tracing::debug!(kind, error = %e, "Query failed");
        }
        result
    }

    /// Nearest chunks to `text`, best first. Pending chunks never match.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is empty, the limit is 0, or embedding
    /// or search fails.
    pub async fn semantic(
        &self,
        text: &str,
        limit: usize,
        filetype: Option<&str>,
        directory: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        if text.trim().is_empty() {
            return Err(QueryError::InvalidQuery("query text is empty".to_string()).into());
        }
        let limit = self.clamp_limit(limit)?;

        let mut filter = ChunkFilter::default();
        if let Some(filetype) = filetype.filter(|f| !f.is_empty()) {
            filter = filter.with_filetype(filetype.trim_start_matches('.'));
        }
        if let Some(directory) = directory.filter(|d| !d.is_empty()) {
            filter = filter.with_path_prefix(directory_prefix(directory));
        }

        let vector = self.embedder.embed(text).await?;
        let results = self.store.vector_search(&vector, limit, &filter)?;

        tracing::debug!(results = results.len(), limit, "Semantic query complete");
        Ok(results.into_iter().map(SearchHit::from).collect())
    }

    /// Chunks whose path or metadata contain the terms, most matches first.
    /// `mode` overrides the configured combination.
    ///
    /// # Errors
    ///
    /// Returns an error if no non-blank term is given, the limit is 0, or
    /// the lookup fails.
    pub fn keyword(
        &self,
        terms: &[String],
        limit: usize,
        mode: Option<KeywordMode>,
    ) -> Result<Vec<SearchHit>> {
        let terms: Vec<String> = terms
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Err(QueryError::InvalidQuery("no keyword terms given".to_string()).into());
        }
        let limit = self.clamp_limit(limit)?;

        let filter = ChunkFilter::keywords(terms, mode.unwrap_or(self.keyword_mode));
        let records = self.store.filter(&filter, limit)?;
        Ok(records.into_iter().map(SearchHit::from).collect())
    }

    /// Reassemble one file from its chunks.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidQuery`] for a relative path and
    /// [`QueryError::NotFound`] when nothing is indexed under it.
    pub fn exact_path(&self, path: &str) -> Result<FileDocument> {
        let requested = Path::new(path);
        if path.is_empty() || !requested.is_absolute() {
            return Err(QueryError::InvalidQuery(format!("path '{path}' must be absolute")).into());
        }
        let path = normalize(requested).to_string_lossy().to_string();

        let chunks = self.store.get_by_path(&path)?;
        let Some(first) = chunks.first() else {
            return Err(QueryError::NotFound(path).into());
        };

        let mut metadata = Map::new();
        for (key, value) in &first.metadata {
            if !CHUNK_ONLY_KEYS.contains(&key.as_str()) {
                metadata.insert(key.clone(), value.clone());
            }
        }

        #[allow(clippy::cast_sign_loss)]
        let content = assemble(
            chunks
                .iter()
                .map(|c| (c.start_line.max(0) as usize, c.content.as_str())),
        );

        Ok(FileDocument {
            filepath: path,
            filetype: first.filetype.clone(),
            content,
            chunk_count: chunks.len(),
            pending_chunks: chunks.iter().filter(|c| c.is_pending()).count(),
            metadata,
            updated_at: chunks.iter().map(|c| c.updated_at).max().unwrap_or_default(),
        })
    }

    /// Indexed paths, most recently inserted first.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit is 0 or the lookup fails.
    pub fn list(&self, limit: usize) -> Result<Vec<String>> {
        let limit = self.clamp_limit(limit)?;
        self.store.list_files(limit)
    }

    /// Index counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the count fails.
    pub fn stats(&self) -> Result<IndexStats> {
        let counts = self.store.count()?;
        metrics::record_counts(&counts);
        Ok(IndexStats::from(counts))
    }

    fn clamp_limit(&self, limit: usize) -> Result<usize> {
        if limit == 0 {
            return Err(QueryError::InvalidQuery("limit must be at least 1".to_string()).into());
        }
        Ok(limit.min(self.max_limit))
    }
}

impl std::fmt::Debug for QueryPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPlanner")
            .field("embedder", &self.embedder)
            .field("keyword_mode", &self.keyword_mode)
            .field("max_limit", &self.max_limit)
            .finish_non_exhaustive()
    }
}

/// `/a/b` and `/a/b/` both become `/a/b/`, so `/a/bc` is not matched.
fn directory_prefix(directory: &str) -> String {
    format!("{}/", directory.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::embeddings::{Embedder, HashEmbedder};
    use crate::error::{EmbeddingError, Error};
    use crate::storage::{init_storage, ChunkRecord, Database, SqliteStore};
    use async_trait::async_trait;

    const DIM: usize = 256;

    struct Offline;

    #[async_trait]
    impl Embedder for Offline {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Permanent("offline".to_string()))
        }

        fn dimension(&self) -> usize {
            DIM
        }
    }

    fn store() -> Arc<dyn ChunkStore> {
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        SqliteStore::shared(db)
    }

    fn planner_with(store: Arc<dyn ChunkStore>, embedder: Arc<dyn Embedder>) -> QueryPlanner {
        let service = EmbeddingService::new(embedder, RetryPolicy::immediate(1), 2, DIM);
        QueryPlanner::new(store, service, KeywordMode::Any, 100)
    }

    fn embedded(record: ChunkRecord) -> ChunkRecord {
        let vector = HashEmbedder::new(DIM).embed_sync(&record.content);
        record.with_embedding(vector)
    }

    fn seed(store: &Arc<dyn ChunkStore>) {
        store
            .upsert(&embedded(
                ChunkRecord::new("/proj/a.py", 0, 1, 2, "def f():\n    return 1", "py")
                    .with_meta("filename", "a.py")
                    .with_meta("directory", "/proj"),
            ))
            .unwrap();
        store
            .upsert(&embedded(
                ChunkRecord::new("/proj/docs/guide.md", 0, 1, 3, "# Guide\n\ncolorless green ideas", "md")
                    .with_meta("filename", "guide.md")
                    .with_meta("directory", "/proj/docs"),
            ))
            .unwrap();
        store
            .upsert(&ChunkRecord::new(
                "/proj/pending.rs",
                0,
                1,
                1,
                "fn pending() { return; }",
                "rs",
            ))
            .unwrap();
    }

    #[tokio::test]
    async fn test_semantic_ranks_by_score() {
        let store = store();
        seed(&store);
        let planner = planner_with(Arc::clone(&store), Arc::new(HashEmbedder::new(DIM)));

        let hits = planner.semantic("return statement", 5, None, None).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].filepath, "/proj/a.py");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|h| !h.pending));
        let score = hits[0].score.unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert!((score - (1.0 - hits[0].distance.unwrap() / 2.0)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_semantic_filters() {
        let store = store();
        seed(&store);
        let planner = planner_with(Arc::clone(&store), Arc::new(HashEmbedder::new(DIM)));

        let by_type = planner.semantic("ideas", 5, Some("md"), None).await.unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].filetype, "md");

        let by_dir = planner.semantic("ideas", 5, None, Some("/proj/docs/")).await.unwrap();
        assert_eq!(by_dir.len(), 1);
        assert_eq!(by_dir[0].filepath, "/proj/docs/guide.md");

        let sibling = planner.semantic("ideas", 5, None, Some("/proj/doc")).await.unwrap();
        assert!(sibling.is_empty());
    }

    #[tokio::test]
    async fn test_semantic_propagates_embedding_failure() {
        let store = store();
        seed(&store);
        let planner = planner_with(store, Arc::new(Offline));

        let err = planner.semantic("anything", 5, None, None).await.unwrap_err();
        assert!(matches!(err, Error::Embedding(EmbeddingError::Permanent(_))));
    }

    #[test]
    fn test_keyword_matches_path_and_metadata() {
        let store = store();
        seed(&store);
        let planner = planner_with(store, Arc::new(HashEmbedder::new(DIM)));

        let hits = planner.keyword(&["PENDING".to_string()], 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].pending);

        let none = planner
            .keyword(&["nonexistent_term_xyz".to_string()], 10, None)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_keyword_mode_override() {
        let store = store();
        seed(&store);
        let planner = planner_with(store, Arc::new(HashEmbedder::new(DIM)));
        let terms = vec!["guide".to_string(), "a.py".to_string()];

        assert_eq!(planner.keyword(&terms, 10, None).unwrap().len(), 2);
        assert!(planner
            .keyword(&terms, 10, Some(KeywordMode::All))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_exact_path_reassembles() {
        let store = store();
        store
            .upsert(&ChunkRecord::new("/p/n.txt", 0, 1, 2, "one\ntwo", "txt").with_meta("size", 14))
            .unwrap();
        store
            .upsert(&ChunkRecord::new("/p/n.txt", 1, 2, 3, "two\nthree", "txt").with_meta("size", 14))
            .unwrap();
        let planner = planner_with(store, Arc::new(HashEmbedder::new(DIM)));

        let doc = planner.exact_path("/p/./n.txt").unwrap();
        assert_eq!(doc.filepath, "/p/n.txt");
        assert_eq!(doc.content, "one\ntwo\nthree");
        assert_eq!(doc.chunk_count, 2);
        assert_eq!(doc.pending_chunks, 2);
        assert_eq!(doc.metadata["size"], 14);
        assert!(!doc.metadata.contains_key("lines"));
    }

    #[test]
    fn test_exact_path_errors() {
        let planner = planner_with(store(), Arc::new(HashEmbedder::new(DIM)));

        assert!(matches!(
            planner.exact_path("relative/a.py").unwrap_err(),
            Error::Query(QueryError::InvalidQuery(_))
        ));
        assert!(matches!(
            planner.exact_path("/nowhere.py").unwrap_err(),
            Error::Query(QueryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_validation_and_clamping() {
        let store = store();
        seed(&store);
        let service = EmbeddingService::new(Arc::new(HashEmbedder::new(DIM)), RetryPolicy::immediate(1), 1, DIM);
        let planner = QueryPlanner::new(store, service, KeywordMode::Any, 1);

        assert!(matches!(
            planner.semantic("  ", 5, None, None).await.unwrap_err(),
            Error::Query(QueryError::InvalidQuery(_))
        ));
        assert!(matches!(
            planner.list(0).unwrap_err(),
            Error::Query(QueryError::InvalidQuery(_))
        ));
        assert!(matches!(
            planner.keyword(&[" ".to_string()], 5, None).unwrap_err(),
            Error::Query(QueryError::InvalidQuery(_))
        ));
        assert_eq!(planner.list(50).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_dispatches() {
        let store = store();
        seed(&store);
        let planner = planner_with(store, Arc::new(HashEmbedder::new(DIM)));

        let QueryResponse::Stats(stats) = planner.execute(Query::Stats).await.unwrap() else {
            panic!("expected stats");
        };
        assert_eq!(stats.files, 3);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.pending_chunks, 1);

        let QueryResponse::Files(files) = planner.execute(Query::List { limit: 10 }).await.unwrap() else {
            panic!("expected files");
        };
        assert_eq!(files[0], "/proj/pending.rs");
    }
}
