use std::collections::HashMap;
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::document::{DocumentId, DocumentStatus};
use crate::error::IndexError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub source: String,
    pub page_count: Option<u32>,
    /// Status of `version`, the version most recently started.
    pub status: DocumentStatus,
    pub version: u32,
    /// Version currently visible to search, if any.
    pub live_version: Option<u32>,
    pub error: Option<String>,
    /// BLAKE3 of the source file, for documents registered from a file.
    pub content_hash: Option<String>,
}

type DocumentRow = (
    i64,
    String,
    Option<i64>,
    String,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
);

const SELECT_DOCUMENT: &str = "SELECT id, source, page_count, status, version, live_version, \
     error, content_hash FROM documents";

/// Outcome of [`DocumentCatalog::register_content`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created(DocumentId),
    /// A document with the same content was registered before.
    Existing(DocumentId),
}

impl Registration {
    #[must_use]
    pub fn id(self) -> DocumentId {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

fn to_u32(value: i64, field: &str) -> Result<u32, IndexError> {
    u32::try_from(value)
        .map_err(|_| IndexError::Consistency(format!("documents.{field} out of range: {value}")))
}

impl TryFrom<DocumentRow> for DocumentRecord {
    type Error = IndexError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let (id, source, page_count, status, version, live_version, error, content_hash) = row;
        Ok(Self {
            id: DocumentId(id),
            source,
            page_count: page_count.map(|n| to_u32(n, "page_count")).transpose()?,
            status: DocumentStatus::from_str(&status).map_err(IndexError::Consistency)?,
            version: to_u32(version, "version")?,
            live_version: live_version
                .map(|v| to_u32(v, "live_version"))
                .transpose()?,
            error,
            content_hash,
        })
    }
}

/// Document lifecycle and version bookkeeping in `SQLite`.
#[derive(Debug, Clone)]
pub struct DocumentCatalog {
    pool: SqlitePool,
}

impl DocumentCatalog {
    /// Open (or create) the catalog database and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open(path: &str) -> Result<Self, IndexError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let mut opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            opts = opts
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&pool).await?;
        tracing::debug!(path, "document catalog ready");

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record an uploaded document and return its new id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn register(
        &self,
        source: &str,
        page_count: Option<u32>,
    ) -> Result<DocumentId, IndexError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO documents (source, page_count, status) VALUES (?, ?, 'uploaded') \
             RETURNING id",
        )
        .bind(source)
        .bind(page_count.map(i64::from))
        .fetch_one(&self.pool)
        .await?;
        Ok(DocumentId(row.0))
    }

    /// Record an uploaded file keyed by its content hash. A second file with the same
    /// content resolves to the existing row instead of creating another one.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert or lookup fails.
    pub async fn register_content(
        &self,
        source: &str,
        page_count: Option<u32>,
        content_hash: &str,
    ) -> Result<Registration, IndexError> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT OR IGNORE INTO documents (source, page_count, status, content_hash) \
             VALUES (?, ?, 'uploaded', ?) RETURNING id",
        )
        .bind(source)
        .bind(page_count.map(i64::from))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((id,)) = inserted {
            return Ok(Registration::Created(DocumentId(id)));
        }
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM documents WHERE content_hash = ?")
            .bind(content_hash)
            .fetch_one(&self.pool)
            .await?;
        Ok(Registration::Existing(DocumentId(id)))
    }

    /// Create a row for a caller-assigned id if none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn ensure(&self, id: DocumentId) -> Result<(), IndexError> {
        sqlx::query("INSERT OR IGNORE INTO documents (id, status) VALUES (?, 'uploaded')")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn get(&self, id: DocumentId) -> Result<Option<DocumentRecord>, IndexError> {
        let row: Option<DocumentRow> = sqlx::query_as(&format!("{SELECT_DOCUMENT} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(DocumentRecord::try_from).transpose()
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list(&self) -> Result<Vec<DocumentRecord>, IndexError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(&format!("{SELECT_DOCUMENT} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DocumentRecord::try_from).collect()
    }

    /// Start (or resume) processing and return the version to write.
    ///
    /// A new or fully embedded document moves to the next version; a document whose last
    /// attempt did not finish keeps its version so the retry overwrites the same chunk ids.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotFound`] if the document does not exist.
    pub async fn begin_version(&self, id: DocumentId) -> Result<u32, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT version, status FROM documents WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let (version, status) = row.ok_or(IndexError::NotFound(id))?;
        let version = to_u32(version, "version")?;
        let status = DocumentStatus::from_str(&status).map_err(IndexError::Consistency)?;

        let next = if version == 0 || status == DocumentStatus::Embedded {
            version + 1
        } else {
            version
        };
        sqlx::query(
            "UPDATE documents SET version = ?, status = 'uploaded', error = NULL, \
             updated_at = datetime('now') WHERE id = ?",
        )
        .bind(i64::from(next))
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Set the status of `version`. A stale version (superseded meanwhile) is an error.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotFound`] if no row matches the id and version.
    pub async fn set_status(
        &self,
        id: DocumentId,
        version: u32,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, error = ?, updated_at = datetime('now') \
             WHERE id = ? AND version = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id.0)
        .bind(i64::from(version))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(IndexError::NotFound(id));
        }
        Ok(())
    }

    /// Flip `version` to embedded and make it the searchable one, in a single statement.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotFound`] if no row matches the id and version.
    pub async fn mark_embedded(&self, id: DocumentId, version: u32) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'embedded', live_version = version, error = NULL, \
             updated_at = datetime('now') WHERE id = ? AND version = ?",
        )
        .bind(id.0)
        .bind(i64::from(version))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(IndexError::NotFound(id));
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_page_count(&self, id: DocumentId, page_count: u32) -> Result<(), IndexError> {
        sqlx::query("UPDATE documents SET page_count = ? WHERE id = ?")
            .bind(i64::from(page_count))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Searchable version for each of `ids` that has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn live_versions(
        &self,
        ids: &[DocumentId],
    ) -> Result<HashMap<DocumentId, u32>, IndexError> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            let row: Option<(Option<i64>,)> =
                sqlx::query_as("SELECT live_version FROM documents WHERE id = ?")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((Some(v),)) = row {
                out.insert(*id, to_u32(v, "live_version")?);
            }
        }
        Ok(out)
    }

    /// Remove the document row. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete(&self, id: DocumentId) -> Result<bool, IndexError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the dimensionality of an embedding model, keeping the first one registered.
    /// Returns the stored value.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn register_model(
        &self,
        model: &str,
        dimensions: usize,
    ) -> Result<usize, IndexError> {
        let dims = i64::try_from(dimensions)
            .map_err(|_| IndexError::Consistency(format!("dimensions too large: {dimensions}")))?;
        sqlx::query("INSERT OR IGNORE INTO embedding_models (model_id, dimensions) VALUES (?, ?)")
            .bind(model)
            .bind(dims)
            .execute(&self.pool)
            .await?;
        let (stored,): (i64,) =
            sqlx::query_as("SELECT dimensions FROM embedding_models WHERE model_id = ?")
                .bind(model)
                .fetch_one(&self.pool)
                .await?;
        usize::try_from(stored)
            .map_err(|_| IndexError::Consistency(format!("stored dimensions invalid: {stored}")))
    }

    /// All registered models and their dimensionality.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn models(&self) -> Result<Vec<(String, usize)>, IndexError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT model_id, dimensions FROM embedding_models ORDER BY model_id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(model, dims)| {
                usize::try_from(dims)
                    .map(|d| (model, d))
                    .map_err(|_| {
                        IndexError::Consistency(format!("stored dimensions invalid: {dims}"))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> DocumentCatalog {
        DocumentCatalog::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn register_and_get() {
        let c = catalog().await;
        let id = c.register("manual.pdf", Some(3)).await.unwrap();
        let doc = c.get(id).await.unwrap().unwrap();
        assert_eq!(doc.source, "manual.pdf");
        assert_eq!(doc.page_count, Some(3));
        assert_eq!(doc.status, DocumentStatus::Uploaded);
        assert_eq!(doc.version, 0);
        assert_eq!(doc.live_version, None);
    }

    #[tokio::test]
    async fn same_content_resolves_to_existing_row() {
        let c = catalog().await;
        let first = c.register_content("/a/manual.txt", Some(2), "abc").await.unwrap();
        assert!(matches!(first, Registration::Created(_)));
        let again = c.register_content("/b/copy.txt", Some(2), "abc").await.unwrap();
        assert_eq!(again, Registration::Existing(first.id()));
        let other = c.register_content("/a/other.txt", None, "def").await.unwrap();
        assert!(matches!(other, Registration::Created(id) if id != first.id()));

        let doc = c.get(first.id()).await.unwrap().unwrap();
        assert_eq!(doc.source, "/a/manual.txt");
        assert_eq!(doc.content_hash.as_deref(), Some("abc"));
        assert_eq!(c.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rows_without_hash_never_collide() {
        let c = catalog().await;
        c.register("a", None).await.unwrap();
        c.register("a", None).await.unwrap();
        assert_eq!(c.list().await.unwrap().len(), 2);
        assert!(c.list().await.unwrap().iter().all(|d| d.content_hash.is_none()));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        assert!(catalog().await.get(DocumentId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let c = catalog().await;
        c.ensure(DocumentId(42)).await.unwrap();
        c.ensure(DocumentId(42)).await.unwrap();
        assert_eq!(c.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn version_lifecycle() {
        let c = catalog().await;
        let id = c.register("a", None).await.unwrap();

        let v1 = c.begin_version(id).await.unwrap();
        assert_eq!(v1, 1);
        c.set_status(id, v1, DocumentStatus::Chunked, None).await.unwrap();
        // Unfinished attempt: retry keeps the version.
        assert_eq!(c.begin_version(id).await.unwrap(), 1);
        c.mark_embedded(id, v1).await.unwrap();

        let doc = c.get(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Embedded);
        assert_eq!(doc.live_version, Some(1));

        // Re-processing an embedded document creates a new version while v1 stays live.
        let v2 = c.begin_version(id).await.unwrap();
        assert_eq!(v2, 2);
        let doc = c.get(id).await.unwrap().unwrap();
        assert_eq!(doc.live_version, Some(1));
        assert_eq!(doc.status, DocumentStatus::Uploaded);
    }

    #[tokio::test]
    async fn failed_status_keeps_error() {
        let c = catalog().await;
        let id = c.register("a", None).await.unwrap();
        let v = c.begin_version(id).await.unwrap();
        c.set_status(id, v, DocumentStatus::Failed, Some("empty text"))
            .await
            .unwrap();
        let doc = c.get(id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.error.as_deref(), Some("empty text"));
        assert_eq!(c.begin_version(id).await.unwrap(), v);
    }

    #[tokio::test]
    async fn stale_version_status_is_rejected() {
        let c = catalog().await;
        let id = c.register("a", None).await.unwrap();
        let v = c.begin_version(id).await.unwrap();
        let err = c
            .set_status(id, v + 1, DocumentStatus::Chunked, None)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::NotFound(_)));
    }

    #[tokio::test]
    async fn live_versions_only_for_embedded() {
        let c = catalog().await;
        let a = c.register("a", None).await.unwrap();
        let b = c.register("b", None).await.unwrap();
        let va = c.begin_version(a).await.unwrap();
        c.mark_embedded(a, va).await.unwrap();
        c.begin_version(b).await.unwrap();

        let live = c.live_versions(&[a, b]).await.unwrap();
        assert_eq!(live.get(&a), Some(&1));
        assert!(!live.contains_key(&b));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let c = catalog().await;
        let id = c.register("a", None).await.unwrap();
        assert!(c.delete(id).await.unwrap());
        assert!(!c.delete(id).await.unwrap());
        assert!(c.begin_version(id).await.is_err());
    }

    #[tokio::test]
    async fn model_registry_keeps_first_dimensions() {
        let c = catalog().await;
        assert_eq!(c.register_model("nomic", 768).await.unwrap(), 768);
        assert_eq!(c.register_model("nomic", 1024).await.unwrap(), 768);
        assert_eq!(c.models().await.unwrap(), vec![("nomic".to_owned(), 768)]);
    }

    #[tokio::test]
    async fn file_backed_catalog_uses_wal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let c = DocumentCatalog::open(file.path().to_str().unwrap())
            .await
            .unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(c.pool())
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
