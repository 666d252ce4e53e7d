#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use seqviz_shop::DocumentStore;
use serde_json::Value;
use time::OffsetDateTime;

const DOCUMENT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
  doc_key TEXT PRIMARY KEY,
  body_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// `SQLite`-backed [`DocumentStore`]: one row per key, each write replaces the row.
pub struct SqliteDocumentStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    /// Open or create a `SQLite` document database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply the document schema. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied or recorded.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply document schema")?;

        let now = rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![DOCUMENT_SCHEMA_VERSION, now],
            )
            .context("failed to record document migration")?;

        Ok(())
    }

    /// When `key` was last written, if ever.
    ///
    /// # Errors
    /// Returns an error on query failure or a malformed stored timestamp.
    pub fn updated_at(&self, key: &str) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM documents WHERE doc_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read document timestamp for {key}"))?;
        raw.as_deref().map(parse_rfc3339).transpose()
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn store_name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body_json FROM documents WHERE doc_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read document {key}"))?;

        match body {
            Some(body) => {
                let value = serde_json::from_str(&body)
                    .with_context(|| format!("document {key} is not valid json"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &Value) -> Result<()> {
        let body = serde_json::to_string(value)?;
        let now = rfc3339(OffsetDateTime::now_utc())?;
        self.conn
            .execute(
                "INSERT INTO documents(doc_key, body_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(doc_key) DO UPDATE SET body_json = excluded.body_json,
                                                    updated_at = excluded.updated_at",
                params![key, body, now],
            )
            .with_context(|| format!("failed to write document {key}"))?;
        tracing::debug!(key, bytes = body.len(), "document written");
        Ok(())
    }
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteDocumentStore;
    use seqviz_shop::{DocumentStore, Shop, SHOP_DOCUMENT_KEY};
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "seqviz-store-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn open_migrated(path: &std::path::Path) -> SqliteDocumentStore {
        let store = SqliteDocumentStore::open(path).unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    #[test]
    fn migrate_is_idempotent() {
        let path = temp_db_path("migrate");
        let store = open_migrated(&path);
        assert!(store.migrate().is_ok());

        let versions: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(versions, 1);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let store = open_migrated(&temp_db_path("missing"));
        let value = store.get("absent").unwrap_or_else(|_| unreachable!());
        assert!(value.is_none());
        let stamp = store.updated_at("absent").unwrap_or_else(|_| unreachable!());
        assert!(stamp.is_none());
    }

    #[test]
    fn set_replaces_whole_document() {
        let store = open_migrated(&temp_db_path("replace"));
        assert!(store.set("doc", &json!({"a": 1, "b": 2})).is_ok());
        assert!(store.set("doc", &json!({"c": 3})).is_ok());

        let value = store.get("doc").unwrap_or_else(|_| unreachable!());
        assert_eq!(value, Some(json!({"c": 3})));
        let stamp = store.updated_at("doc").unwrap_or_else(|_| unreachable!());
        assert!(stamp.is_some());
    }

    #[test]
    fn shop_state_survives_reopen() {
        let path = temp_db_path("shop");
        {
            let mut shop = Shop::open(Box::new(open_migrated(&path)));
            let product = shop
                .get_product("acc-3")
                .cloned()
                .unwrap_or_else(|| unreachable!());
            shop.add_to_cart(&product);
        }

        let store = open_migrated(&path);
        assert!(store
            .get(SHOP_DOCUMENT_KEY)
            .unwrap_or_else(|_| unreachable!())
            .is_some());
        let shop = Shop::open(Box::new(store));
        assert_eq!(shop.cart_count(), 1);
        assert_eq!(shop.cart()[0].product.id, "acc-3");
    }

    #[test]
    fn unmigrated_database_reports_errors() {
        let store =
            SqliteDocumentStore::open(&temp_db_path("bare")).unwrap_or_else(|_| unreachable!());
        assert!(store.get("doc").is_err());
        assert!(store.set("doc", &json!({})).is_err());
    }
}
