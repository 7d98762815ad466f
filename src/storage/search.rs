//! Vector similarity and structured chunk search.

use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;

use super::chunks::{row_to_chunk, CHUNK_COLUMNS};
use super::models::{ChunkFilter, ChunkRecord, SearchResult};
use super::vector::vector_to_blob;
use crate::config::KeywordMode;
use crate::error::StorageError;
use crate::Result;

/// SQL function folding text with Unicode case rules, matching
/// [`str::to_lowercase`] on the query side. `SQLite`'s own `lower()` folds
/// ASCII only.
const FOLD_FUNCTION: &str = "unicode_lower";

/// Bookkeeping metadata keys whose values never match keyword terms.
const UNSEARCHED_METADATA_KEYS: &[&str] = &["file_hash", "mtime", "size", "lines"];

/// Register the SQL functions keyword filters rely on.
///
/// # Errors
///
/// Returns an error if a function cannot be registered.
pub(crate) fn register_search_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        FOLD_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let folded = match ctx.get_raw(0) {
                ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).to_lowercase()),
                ValueRef::Integer(i) => Some(i.to_string()),
                ValueRef::Real(f) => Some(f.to_string()),
                ValueRef::Null | ValueRef::Blob(_) => None,
            };
            Ok(folded)
        },
    )
    .map_err(|e| StorageError::Database(format!("failed to register {FOLD_FUNCTION}: {e}")))?;
    Ok(())
}

/// A keyword term matches the file path or any searchable metadata value.
/// Metadata keys themselves never match.
fn term_expr(param: usize) -> String {
    let skipped = UNSEARCHED_METADATA_KEYS
        .iter()
        .map(|k| format!("'{k}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "(instr({FOLD_FUNCTION}(chunks.file_path), ?{param}) > 0 \
         OR EXISTS (SELECT 1 FROM json_each(chunks.metadata) AS meta \
         WHERE meta.key NOT IN ({skipped}) \
         AND instr({FOLD_FUNCTION}(meta.value), ?{param}) > 0))"
    )
}

/// SQL fragments and bound values built from a [`ChunkFilter`].
struct FilterSql {
    clauses: Vec<String>,
    /// Expression counting how many keyword terms a row matches.
    match_count: Option<String>,
    params: Vec<SqlValue>,
}

impl FilterSql {
    /// Build clauses, numbering parameters from `first_param`.
    fn build(filter: &ChunkFilter, first_param: usize) -> Self {
        let mut clauses = Vec::new();
        let mut params = Vec::new();
        let mut next = first_param;

        if let Some(filetype) = &filter.filetype {
            clauses.push(format!("filetype = ?{next}"));
            params.push(SqlValue::Text(filetype.to_lowercase()));
            next += 1;
        }

        if let Some(prefix) = &filter.path_prefix {
            clauses.push(format!("substr(file_path, 1, length(?{next})) = ?{next}"));
            params.push(SqlValue::Text(prefix.clone()));
            next += 1;
        }

        let term_exprs: Vec<String> = filter
            .terms
            .iter()
            .map(|term| {
                let expr = term_expr(next);
                params.push(SqlValue::Text(term.to_lowercase()));
                next += 1;
                expr
            })
            .collect();

        let match_count = if term_exprs.is_empty() {
            None
        } else {
            let joiner = match filter.mode {
                KeywordMode::Any => " OR ",
                KeywordMode::All => " AND ",
            };
            clauses.push(format!("({})", term_exprs.join(joiner)));
            Some(term_exprs.join(" + "))
        };

        Self {
            clauses,
            match_count,
            params,
        }
    }

    fn where_suffix(&self) -> String {
        self.clauses
            .iter()
            .map(|c| format!(" AND {c}"))
            .collect::<String>()
    }
}

/// Nearest chunks to `query_embedding` by cosine distance.
///
/// Pending chunks and chunks of another dimensionality are never
/// candidates. Ties on distance go to the more recently updated chunk.
///
/// # Errors
///
/// Returns an error if the search fails.
pub fn search_chunks(
    conn: &Connection,
    query_embedding: &[f32],
    limit: usize,
    filter: &ChunkFilter,
) -> Result<Vec<SearchResult<ChunkRecord>>> {
    let sql_filter = FilterSql::build(filter, 3);
    let limit_param = 3 + sql_filter.params.len();

    let sql = format!(
        "SELECT {CHUNK_COLUMNS}, vec_distance_cosine(embedding, ?1) AS distance
         FROM chunks
         WHERE embedding IS NOT NULL AND embedding_dim = ?2{}
         ORDER BY distance ASC, updated_at DESC
         LIMIT ?{limit_param}",
        sql_filter.where_suffix()
    );

    let mut params = vec![
        SqlValue::Blob(vector_to_blob(query_embedding)),
        SqlValue::Integer(i64::try_from(query_embedding.len()).unwrap_or(i64::MAX)),
    ];
    params.extend(sql_filter.params);
    params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| StorageError::Vector(format!("failed to prepare search: {e}")))?;

    let results = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            let chunk = row_to_chunk(row)?;
            #[allow(clippy::cast_possible_truncation)]
            let distance = row.get::<_, f64>(12)? as f32;
            Ok(SearchResult::new(chunk, distance))
        })
        .map_err(|e| StorageError::Vector(format!("failed to execute search: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| StorageError::Vector(format!("failed to read result: {e}")))?;

    tracing::debug!(results = results.len(), limit, "Vector search complete");
    Ok(results)
}

/// Chunks matching a structured filter, independent of embeddings.
///
/// Rows matching more keyword terms come first, then the most recently
/// updated.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn filter_chunks(conn: &Connection, filter: &ChunkFilter, limit: usize) -> Result<Vec<ChunkRecord>> {
    let sql_filter = FilterSql::build(filter, 1);
    let limit_param = 1 + sql_filter.params.len();

    let order = sql_filter
        .match_count
        .as_ref()
        .map_or_else(String::new, |count| format!("({count}) DESC, "));

    let sql = format!(
        "SELECT {CHUNK_COLUMNS} FROM chunks
         WHERE 1 = 1{}
         ORDER BY {order}updated_at DESC, file_path, chunk_index
         LIMIT ?{limit_param}",
        sql_filter.where_suffix()
    );

    let mut params = sql_filter.params;
    params.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
    let chunks = stmt
        .query_map(rusqlite::params_from_iter(params), row_to_chunk)
        .map_err(StorageError::from)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StorageError::from)?;

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{migrate, upsert_chunk, Database};

    fn setup_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| migrate(conn)).unwrap();
        db
    }

    fn insert(db: &Database, path: &str, filetype: &str, embedding: Option<Vec<f32>>) {
        let mut chunk = ChunkRecord::new(path, 0, 1, 1, format!("content of {path}"), filetype)
            .with_meta("filename", path.rsplit('/').next().unwrap_or(path));
        chunk.embedding = embedding;
        db.with_conn(|conn| upsert_chunk(conn, &chunk)).unwrap();
    }

    #[test]
    fn test_search_orders_by_distance() {
        let db = setup_db();
        insert(&db, "/exact.rs", "rs", Some(vec![1.0, 0.0, 0.0, 0.0]));
        insert(&db, "/close.rs", "rs", Some(vec![0.9, 0.1, 0.0, 0.0]));
        insert(&db, "/far.rs", "rs", Some(vec![0.0, 1.0, 0.0, 0.0]));

        let results = db
            .with_conn(|conn| {
                search_chunks(conn, &[1.0, 0.0, 0.0, 0.0], 3, &ChunkFilter::default())
            })
            .unwrap();

        let paths: Vec<&str> = results.iter().map(|r| r.record.file_path.as_str()).collect();
        assert_eq!(paths, vec!["/exact.rs", "/close.rs", "/far.rs"]);
        assert!((results[0].score - 1.0).abs() < 1e-4);
        assert!((results[2].score - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_search_skips_pending_and_other_dimensions() {
        let db = setup_db();
        insert(&db, "/pending.rs", "rs", None);
        insert(&db, "/wide.rs", "rs", Some(vec![1.0; 8]));
        insert(&db, "/fits.rs", "rs", Some(vec![1.0, 0.0, 0.0, 0.0]));

        let results = db
            .with_conn(|conn| {
                search_chunks(conn, &[1.0, 0.0, 0.0, 0.0], 10, &ChunkFilter::default())
            })
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.file_path, "/fits.rs");
    }

    #[test]
    fn test_search_with_filetype_and_prefix() {
        let db = setup_db();
        insert(&db, "/etc/nixos/configuration.nix", "nix", Some(vec![1.0, 0.0]));
        insert(&db, "/home/u/flake.nix", "nix", Some(vec![1.0, 0.0]));
        insert(&db, "/etc/nixos/notes.md", "md", Some(vec![1.0, 0.0]));

        let filter = ChunkFilter::default()
            .with_filetype("NIX")
            .with_path_prefix("/etc/nixos/");
        let results = db
            .with_conn(|conn| search_chunks(conn, &[1.0, 0.0], 10, &filter))
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.file_path, "/etc/nixos/configuration.nix");
    }

    #[test]
    fn test_filter_any_and_all() {
        let db = setup_db();
        insert(&db, "/src/Parser.rs", "rs", None);
        insert(&db, "/src/lexer.rs", "rs", None);
        insert(&db, "/docs/parser_lexer.md", "md", Some(vec![1.0]));

        let any = ChunkFilter::keywords(vec!["parser".into(), "LEXER".into()], KeywordMode::Any);
        let results = db.with_conn(|conn| filter_chunks(conn, &any, 10)).unwrap();
        assert_eq!(results.len(), 3);
        // Matches both terms, so it ranks first.
        assert_eq!(results[0].file_path, "/docs/parser_lexer.md");

        let all = ChunkFilter::keywords(vec!["parser".into(), "lexer".into()], KeywordMode::All);
        let results = db.with_conn(|conn| filter_chunks(conn, &all, 10)).unwrap();
        assert_eq!(results.len(), 1);
    }

    fn insert_with_meta(db: &Database, path: &str, meta: &[(&str, serde_json::Value)]) {
        let mut chunk = ChunkRecord::new(path, 0, 1, 3, "body", "md");
        for (key, value) in meta {
            chunk = chunk.with_meta(*key, value.clone());
        }
        db.with_conn(|conn| upsert_chunk(conn, &chunk)).unwrap();
    }

    fn matching(db: &Database, term: &str) -> Vec<String> {
        let filter = ChunkFilter::keywords(vec![term.to_string()], KeywordMode::Any);
        db.with_conn(|conn| filter_chunks(conn, &filter, 10))
            .unwrap()
            .into_iter()
            .map(|c| c.file_path)
            .collect()
    }

    #[test]
    fn test_filter_matches_metadata_values_not_keys() {
        let db = setup_db();
        insert_with_meta(
            &db,
            "/proj/notes.md",
            &[
                ("filename", serde_json::json!("notes.md")),
                ("directory", serde_json::json!("/proj")),
                ("author", serde_json::json!("Quinn")),
                ("size", serde_json::json!(4096)),
                ("mtime", serde_json::json!(1_700_000_000_000_i64)),
                ("file_hash", serde_json::json!("deadbeefcafe0123")),
            ],
        );

        for key in ["filename", "directory", "lines", "size", "mtime", "file_hash", "author"] {
            assert!(matching(&db, key).is_empty(), "key {key} matched");
        }
        assert!(matching(&db, "beefcafe").is_empty());
        assert!(matching(&db, "4096").is_empty());

        assert_eq!(matching(&db, "quinn"), vec!["/proj/notes.md"]);
        assert_eq!(matching(&db, "NOTES.MD"), vec!["/proj/notes.md"]);
    }

    #[test]
    fn test_filter_folds_non_ascii_case() {
        let db = setup_db();
        insert_with_meta(&db, "/proj/ÄRGER.md", &[("filename", serde_json::json!("ÄRGER.md"))]);
        insert_with_meta(&db, "/proj/straße.txt", &[("title", serde_json::json!("ÉTÉ"))]);

        assert_eq!(matching(&db, "ÄRGER"), vec!["/proj/ÄRGER.md"]);
        assert_eq!(matching(&db, "ärger"), vec!["/proj/ÄRGER.md"]);
        assert_eq!(matching(&db, "Ärger"), vec!["/proj/ÄRGER.md"]);
        assert_eq!(matching(&db, "STRASSE").len(), 0);
        assert_eq!(matching(&db, "STRAßE"), vec!["/proj/straße.txt"]);
        assert_eq!(matching(&db, "été"), vec!["/proj/straße.txt"]);
    }

    #[test]
    fn test_filter_no_match_is_empty() {
        let db = setup_db();
        insert(&db, "/a.rs", "rs", None);

        let filter = ChunkFilter::keywords(vec!["nonexistent_term_xyz".into()], KeywordMode::Any);
        let results = db.with_conn(|conn| filter_chunks(conn, &filter, 10)).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_filter_respects_limit() {
        let db = setup_db();
        for i in 0..5 {
            insert(&db, &format!("/many/{i}.txt"), "txt", None);
        }

        let filter = ChunkFilter::keywords(vec!["many".into()], KeywordMode::Any);
        let results = db.with_conn(|conn| filter_chunks(conn, &filter, 2)).unwrap();
        assert_eq!(results.len(), 2);
    }
}
