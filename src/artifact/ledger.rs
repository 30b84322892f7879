//! Artifact metadata ledger.
//!
//! One row per artifact in `artifacts`, one append-only row per change in
//! `artifact_audit`. Reads go through the shared cache (`artifact:<id>:meta`)
//! and every write invalidates that entry.

use anyhow::Result;
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::db::Database;
use crate::{now_s, SYSTEM_ORIGINATOR};

const META_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_QUERY_LIMIT: u32 = 100;
pub const MAX_QUERY_LIMIT: u32 = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub artifact_id: Uuid,
    pub originator: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub mime_type: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub tags: Map<String, Value>,
    pub access_control: AccessControl,
    pub version: i64,
    pub last_accessed: Option<i64>,
    pub access_count: i64,
}

impl ArtifactMetadata {
    /// Owner, listed principals and the system identity are allowed. The read
    /// and write lists are independent: write access does not grant read.
    pub fn permits(&self, requester: &str, access: Access) -> bool {
        if requester == SYSTEM_ORIGINATOR || requester == self.originator {
            return true;
        }
        let list = match access {
            Access::Read => &self.access_control.read,
            Access::Write => &self.access_control.write,
        };
        list.iter().any(|principal| principal == requester)
    }

    pub fn is_expired(&self, now_s: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    SizeBytes,
    LastAccessed,
    AccessCount,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::SizeBytes => "size_bytes",
            SortField::LastAccessed => "last_accessed",
            SortField::AccessCount => "access_count",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort and page for `query`. Tag filters match when every listed
/// key has exactly the given scalar value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactQuery {
    pub originator: Option<String>,
    pub mime_type: Option<String>,
    pub tags: Map<String, Value>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub expires_before: Option<i64>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    pub limit: Option<u32>,
    pub offset: u64,
}

impl ArtifactQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }
}

/// Fields an update may change. `expires_at: Some(None)` clears the expiry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<AccessControl>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<Option<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ArtifactUpdate {
    pub fn is_empty(&self) -> bool {
        self.tags.is_none()
            && self.access_control.is_none()
            && self.expires_at.is_none()
            && self.mime_type.is_none()
    }
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub sequence: i64,
    pub artifact_id: Uuid,
    pub action: String,
    pub changed_by: String,
    pub changes: Value,
    pub at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub artifact_count: u64,
    pub total_bytes: u64,
    pub originators: u64,
    pub expired: u64,
}

pub struct Ledger {
    db: Arc<Database>,
    cache: Arc<dyn SharedCache>,
}

impl Ledger {
    pub fn new(db: Arc<Database>, cache: Arc<dyn SharedCache>) -> Self {
        Self { db, cache }
    }

    pub fn record(&self, meta: &ArtifactMetadata, changed_by: &str) -> Result<()> {
        let tags = serde_json::to_string(&meta.tags)?;
        let acl = serde_json::to_string(&meta.access_control)?;
        let changes = json!({
            "sizeBytes": meta.size_bytes,
            "contentHash": meta.content_hash,
            "mimeType": meta.mime_type,
            "expiresAt": meta.expires_at,
        });
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                r#"
                INSERT INTO artifacts(artifact_id, originator, size_bytes, sha256, mime_type,
                                      created_at, expires_at, tags, access_control, version,
                                      last_accessed, access_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    meta.artifact_id.to_string(),
                    meta.originator,
                    meta.size_bytes as i64,
                    meta.content_hash,
                    meta.mime_type,
                    meta.created_at,
                    meta.expires_at,
                    tags,
                    acl,
                    meta.version,
                    meta.last_accessed,
                    meta.access_count,
                ],
            )?;
            append_audit(&tx, &meta.artifact_id, "create", changed_by, &changes)?;
            tx.commit()
        })?;
        self.forget(&meta.artifact_id);
        Ok(())
    }

    pub fn get(&self, artifact_id: &Uuid) -> Result<Option<ArtifactMetadata>> {
        let key = meta_key(artifact_id);
        match self.cache.get(&key) {
            Ok(Some(raw)) => match serde_json::from_slice(&raw) {
                Ok(meta) => return Ok(Some(meta)),
                Err(err) => log::warn!("discarding unreadable cached metadata {key}: {err}"),
            },
            Ok(None) => {}
            Err(err) => log::warn!("artifact metadata cache unavailable: {err:#}"),
        }

        // The fill happens while the connection is held. Writers invalidate
        // after their commit releases it, so a row read here can never be
        // cached after a newer version was invalidated.
        self.db.with_conn(|conn| {
            let meta = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM artifacts WHERE artifact_id = ?1"),
                    params![artifact_id.to_string()],
                    metadata_from_row,
                )
                .optional()?;
            if let Some(meta) = &meta {
                self.fill(&key, meta);
            }
            Ok(meta)
        })
    }

    fn fill(&self, key: &str, meta: &ArtifactMetadata) {
        match serde_json::to_vec(meta) {
            Ok(raw) => {
                if let Err(err) = self.cache.set_with_ttl(key, &raw, META_CACHE_TTL) {
                    log::warn!("artifact metadata not cached: {err:#}");
                }
            }
            Err(err) => log::warn!("artifact metadata not serializable: {err}"),
        }
    }

    /// Runs a filtered page query. `readable_by` restricts the result to
    /// artifacts that principal may read.
    pub fn query(
        &self,
        query: &ArtifactQuery,
        readable_by: Option<&str>,
    ) -> Result<Vec<ArtifactMetadata>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(principal) = readable_by {
            values.push(SqlValue::Text(principal.to_string()));
            let n = values.len();
            clauses.push(format!(
                "(originator = ?{n} OR EXISTS (SELECT 1 FROM json_each(artifacts.access_control, '$.read') WHERE json_each.value = ?{n}))"
            ));
        }
        if let Some(originator) = &query.originator {
            values.push(SqlValue::Text(originator.clone()));
            clauses.push(format!("originator = ?{}", values.len()));
        }
        if let Some(mime) = &query.mime_type {
            values.push(SqlValue::Text(mime.clone()));
            clauses.push(format!("mime_type = ?{}", values.len()));
        }
        for (key, value) in &query.tags {
            values.push(SqlValue::Text(key.clone()));
            let key_idx = values.len();
            values.push(tag_value(key, value)?);
            let value_idx = values.len();
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM json_each(artifacts.tags) WHERE json_each.key = ?{key_idx} AND json_each.value = ?{value_idx})"
            ));
        }
        let bounds = [
            ("created_at >", query.created_after),
            ("created_at <", query.created_before),
            ("expires_at <", query.expires_before),
            ("size_bytes >=", query.min_size.map(|v| v as i64)),
            ("size_bytes <=", query.max_size.map(|v| v as i64)),
        ];
        for (predicate, bound) in bounds {
            if let Some(bound) = bound {
                values.push(SqlValue::Integer(bound));
                clauses.push(format!("{predicate} ?{}", values.len()));
            }
        }

        let mut sql = format!("SELECT {COLUMNS} FROM artifacts");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let direction = match query.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        sql.push_str(&format!(
            " ORDER BY {} {direction}, artifact_id ASC LIMIT {} OFFSET {}",
            query.sort_by.column(),
            query.effective_limit(),
            query.offset
        ));

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), metadata_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Applies `changes`, bumps `version` and appends an audit row. Returns
    /// `None` when the artifact does not exist.
    pub fn update(
        &self,
        artifact_id: &Uuid,
        changes: &ArtifactUpdate,
        changed_by: &str,
    ) -> Result<Option<ArtifactMetadata>> {
        let tags = changes.tags.as_ref().map(serde_json::to_string).transpose()?;
        let acl = changes
            .access_control
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let audit = serde_json::to_value(changes)?;
        let id = artifact_id.to_string();
        let updated = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut sets = vec!["version = version + 1".to_string()];
            let mut values: Vec<SqlValue> = Vec::new();
            if let Some(tags) = &tags {
                values.push(SqlValue::Text(tags.clone()));
                sets.push(format!("tags = ?{}", values.len()));
            }
            if let Some(acl) = &acl {
                values.push(SqlValue::Text(acl.clone()));
                sets.push(format!("access_control = ?{}", values.len()));
            }
            if let Some(expires_at) = changes.expires_at {
                values.push(expires_at.map_or(SqlValue::Null, SqlValue::Integer));
                sets.push(format!("expires_at = ?{}", values.len()));
            }
            if let Some(mime) = &changes.mime_type {
                values.push(SqlValue::Text(mime.clone()));
                sets.push(format!("mime_type = ?{}", values.len()));
            }
            values.push(SqlValue::Text(id.clone()));
            let sql = format!(
                "UPDATE artifacts SET {} WHERE artifact_id = ?{}",
                sets.join(", "),
                values.len()
            );
            if tx.execute(&sql, params_from_iter(values.iter()))? == 0 {
                return Ok(None);
            }
            append_audit(&tx, artifact_id, "update", changed_by, &audit)?;
            let meta = tx.query_row(
                &format!("SELECT {COLUMNS} FROM artifacts WHERE artifact_id = ?1"),
                params![id],
                metadata_from_row,
            )?;
            tx.commit()?;
            Ok(Some(meta))
        })?;
        self.forget(artifact_id);
        Ok(updated)
    }

    /// Records new content for an existing artifact (replace upload).
    pub fn replace_content(&self, meta: &ArtifactMetadata, changed_by: &str) -> Result<bool> {
        let tags = serde_json::to_string(&meta.tags)?;
        let acl = serde_json::to_string(&meta.access_control)?;
        let changes = json!({
            "replaced": true,
            "sizeBytes": meta.size_bytes,
            "contentHash": meta.content_hash,
        });
        let replaced = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let n = tx.execute(
                r#"
                UPDATE artifacts
                SET size_bytes = ?2, sha256 = ?3, mime_type = ?4, expires_at = ?5, tags = ?6,
                    access_control = ?7, version = version + 1
                WHERE artifact_id = ?1
                "#,
                params![
                    meta.artifact_id.to_string(),
                    meta.size_bytes as i64,
                    meta.content_hash,
                    meta.mime_type,
                    meta.expires_at,
                    tags,
                    acl,
                ],
            )?;
            if n == 0 {
                return Ok(false);
            }
            append_audit(&tx, &meta.artifact_id, "update", changed_by, &changes)?;
            tx.commit()?;
            Ok(true)
        })?;
        self.forget(&meta.artifact_id);
        Ok(replaced)
    }

    pub fn delete(&self, artifact_id: &Uuid, changed_by: &str) -> Result<bool> {
        let id = artifact_id.to_string();
        let deleted = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            if tx.execute("DELETE FROM artifacts WHERE artifact_id = ?1", params![id])? == 0 {
                return Ok(false);
            }
            append_audit(&tx, artifact_id, "delete", changed_by, &json!({}))?;
            tx.commit()?;
            Ok(true)
        })?;
        self.forget(artifact_id);
        Ok(deleted)
    }

    /// IDs whose expiry is at or before `now_s`.
    pub fn expired(&self, now_s: i64) -> Result<Vec<Uuid>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT artifact_id FROM artifacts WHERE expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY expires_at",
            )?;
            let ids = stmt
                .query_map(params![now_s], |row| uuid_column(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }

    pub fn audit_trail(&self, artifact_id: &Uuid) -> Result<Vec<AuditEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, artifact_id, action, changed_by, changes, created_at FROM artifact_audit WHERE artifact_id = ?1 ORDER BY id",
            )?;
            let entries = stmt
                .query_map(params![artifact_id.to_string()], |row| {
                    Ok(AuditEntry {
                        sequence: row.get(0)?,
                        artifact_id: uuid_column(row, 1)?,
                        action: row.get(2)?,
                        changed_by: row.get(3)?,
                        changes: json_column(row, 4)?,
                        at: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let now = now_s();
        self.db.with_conn(|conn| {
            conn.query_row(
                r#"
                SELECT COUNT(*), COALESCE(SUM(size_bytes), 0), COUNT(DISTINCT originator),
                       COALESCE(SUM(CASE WHEN expires_at IS NOT NULL AND expires_at <= ?1 THEN 1 ELSE 0 END), 0)
                FROM artifacts
                "#,
                params![now],
                |row| {
                    Ok(LedgerStats {
                        artifact_count: row.get::<_, i64>(0)? as u64,
                        total_bytes: row.get::<_, i64>(1)? as u64,
                        originators: row.get::<_, i64>(2)? as u64,
                        expired: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
        })
    }

    pub fn usage_bytes(&self, originator: &str) -> Result<u64> {
        let total: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM artifacts WHERE originator = ?1",
                params![originator],
                |row| row.get(0),
            )
        })?;
        Ok(total as u64)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get(0))
        })?;
        Ok(count as u64)
    }

    /// Access tracking for downloads. Not audited.
    pub fn touch(&self, artifact_id: &Uuid, now_s: i64) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE artifacts SET last_accessed = ?2, access_count = access_count + 1 WHERE artifact_id = ?1",
                params![artifact_id.to_string(), now_s],
            )
        })?;
        self.forget(artifact_id);
        Ok(())
    }

    fn forget(&self, artifact_id: &Uuid) {
        if let Err(err) = self.cache.delete(&meta_key(artifact_id)) {
            log::warn!("artifact metadata cache invalidation failed: {err:#}");
        }
    }
}

const COLUMNS: &str = "artifact_id, originator, size_bytes, sha256, mime_type, created_at, \
                       expires_at, tags, access_control, version, last_accessed, access_count";

fn meta_key(artifact_id: &Uuid) -> String {
    format!("artifact:{artifact_id}:meta")
}

fn append_audit(
    conn: &Connection,
    artifact_id: &Uuid,
    action: &str,
    changed_by: &str,
    changes: &Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO artifact_audit(artifact_id, action, changed_by, changes, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            artifact_id.to_string(),
            action,
            changed_by,
            changes.to_string(),
            now_s(),
        ],
    )?;
    Ok(())
}

fn tag_value(key: &str, value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        _ => anyhow::bail!("tag filter '{key}' must be a string, number or boolean"),
    })
}

fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<ArtifactMetadata> {
    Ok(ArtifactMetadata {
        artifact_id: uuid_column(row, 0)?,
        originator: row.get(1)?,
        size_bytes: row.get::<_, i64>(2)? as u64,
        content_hash: row.get(3)?,
        mime_type: row.get(4)?,
        created_at: row.get(5)?,
        expires_at: row.get(6)?,
        tags: json_column(row, 7)?,
        access_control: json_column(row, 8)?,
        version: row.get(9)?,
        last_accessed: row.get(10)?,
        access_count: row.get(11)?,
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}
