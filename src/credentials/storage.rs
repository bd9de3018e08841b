//! Durable credential records backed by SQLite.
//!
//! Tokens arrive here already encrypted; this layer only moves
//! [`EncryptedBlob`] JSON in and out of the `credential_accounts` table.

use super::{CredentialRecord, CredentialStatus};
use crate::crypto::{EncryptedBlob, SCHEMA_VERSION};
use crate::metadata::TokenMetadata;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Narrow CRUD contract the lifecycle manager needs from durable storage.
///
/// Implementations are synchronous; the manager runs every call on the
/// blocking pool under a timeout.
pub trait CredentialRepository: Send + Sync {
    /// Inserts a new record. Fails if the id already exists.
    fn insert(&self, record: &CredentialRecord) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<CredentialRecord>>;

    /// Records owned by `user_id`, optionally restricted to one organization.
    fn list_by_owner(&self, user_id: &str, organization_id: Option<&str>) -> Result<Vec<CredentialRecord>>;

    /// Replaces the token pair if the stored rotation count still equals
    /// `expected_rotation_count` and the record is not disconnected.
    ///
    /// Returns `false` when the guard did not match (nothing written).
    fn update_rotation(&self, update: &RotationUpdate) -> Result<bool>;

    fn set_status(&self, id: &str, status: CredentialStatus, updated_at: DateTime<Utc>) -> Result<bool>;

    /// Disconnects the record and nulls its secrets. Returns `false` if the
    /// record is missing or already disconnected.
    fn revoke(&self, id: &str, revoked_at: DateTime<Utc>, reason: &str) -> Result<bool>;
}

/// New token pair and metadata written by a successful rotation.
#[derive(Debug, Clone)]
pub struct RotationUpdate {
    pub id: String,
    pub expected_rotation_count: u32,
    pub access_token: EncryptedBlob,
    pub refresh_token: Option<EncryptedBlob>,
    pub metadata: TokenMetadata,
    pub updated_at: DateTime<Utc>,
}

/// JSON stored in the `platform_metadata` column.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformMetadata {
    token_metadata: TokenMetadata,
    scopes: Vec<String>,
    encryption_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revocation_reason: Option<String>,
}

impl PlatformMetadata {
    fn new(metadata: &TokenMetadata) -> Self {
        Self {
            token_metadata: metadata.clone(),
            scopes: metadata.scopes.iter().cloned().collect(),
            encryption_version: SCHEMA_VERSION.to_string(),
            revoked_at: None,
            revocation_reason: None,
        }
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, organization_id, platform, username,
           access_token, refresh_token, token_expires_at, status,
           platform_metadata, created_at, updated_at
    FROM credential_accounts
"#;

/// Columns of one row before JSON and timestamp decoding.
struct RawRow {
    id: String,
    user_id: String,
    organization_id: Option<String>,
    platform: String,
    username: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_expires_at: Option<String>,
    status: String,
    platform_metadata: String,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            organization_id: row.get(2)?,
            platform: row.get(3)?,
            username: row.get(4)?,
            access_token: row.get(5)?,
            refresh_token: row.get(6)?,
            token_expires_at: row.get(7)?,
            status: row.get(8)?,
            platform_metadata: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<CredentialRecord> {
        let meta: PlatformMetadata = serde_json::from_str(&self.platform_metadata)
            .context("Failed to parse platform_metadata")?;
        let status = CredentialStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("Unknown credential status '{}'", self.status))?;

        Ok(CredentialRecord {
            encrypted_access_token: parse_blob(self.access_token.as_deref(), "access_token")?,
            encrypted_refresh_token: parse_blob(self.refresh_token.as_deref(), "refresh_token")?,
            token_expires_at: self
                .token_expires_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .context("Failed to parse token_expires_at")?,
            created_at: parse_timestamp(&self.created_at).context("Failed to parse created_at")?,
            updated_at: parse_timestamp(&self.updated_at).context("Failed to parse updated_at")?,
            id: self.id,
            owner_user_id: self.user_id,
            organization_id: self.organization_id,
            platform: self.platform,
            external_username: self.username,
            metadata: meta.token_metadata,
            status,
            revoked_at: meta.revoked_at,
            revocation_reason: meta.revocation_reason,
        })
    }
}

fn parse_blob(value: Option<&str>, column: &str) -> Result<Option<EncryptedBlob>> {
    value
        .map(serde_json::from_str)
        .transpose()
        .with_context(|| format!("Failed to parse {} envelope", column))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn blob_json(blob: Option<&EncryptedBlob>) -> Result<Option<String>> {
    blob.map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize encrypted token")
}

/// Credential records in a SQLite database.
///
/// # Schema
/// ```sql
/// CREATE TABLE credential_accounts (
///     id TEXT PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     organization_id TEXT,
///     platform TEXT NOT NULL,
///     username TEXT NOT NULL,
///     access_token TEXT,            -- EncryptedBlob JSON, NULL once revoked
///     refresh_token TEXT,           -- EncryptedBlob JSON
///     token_expires_at TEXT,        -- RFC 3339
///     status TEXT NOT NULL,
///     rotation_count INTEGER NOT NULL,
///     platform_metadata TEXT NOT NULL,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL
/// );
/// ```
///
/// The connection is wrapped in a Mutex; each method holds it for one
/// statement, so every write is atomic with respect to this process.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Opens (or creates) the database and ensures the schema exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credential database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credential_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                organization_id TEXT,
                platform TEXT NOT NULL,
                username TEXT NOT NULL,
                access_token TEXT,
                refresh_token TEXT,
                token_expires_at TEXT,
                status TEXT NOT NULL,
                rotation_count INTEGER NOT NULL DEFAULT 0,
                platform_metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credential_owner
                ON credential_accounts(user_id, organization_id);
            "#,
        )
        .context("Failed to create credential_accounts table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Credential database lock poisoned"))
    }
}

impl CredentialRepository for SqliteCredentialStore {
    fn insert(&self, record: &CredentialRecord) -> Result<()> {
        let platform_metadata = serde_json::to_string(&PlatformMetadata::new(&record.metadata))
            .context("Failed to serialize platform_metadata")?;

        self.lock()?
            .execute(
                r#"
                INSERT INTO credential_accounts (
                    id, user_id, organization_id, platform, username,
                    access_token, refresh_token, token_expires_at, status,
                    rotation_count, platform_metadata, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    record.id,
                    record.owner_user_id,
                    record.organization_id,
                    record.platform,
                    record.external_username,
                    blob_json(record.encrypted_access_token.as_ref())?,
                    blob_json(record.encrypted_refresh_token.as_ref())?,
                    record.token_expires_at.map(|dt| dt.to_rfc3339()),
                    record.status.as_str(),
                    record.metadata.rotation_count,
                    platform_metadata,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert credential record")?;

        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(&format!("{} WHERE id = ?1", SELECT_COLUMNS), params![id], RawRow::from_row)
            .optional()
            .context("Failed to query credential record")?;

        raw.map(RawRow::into_record).transpose()
    }

    fn list_by_owner(&self, user_id: &str, organization_id: Option<&str>) -> Result<Vec<CredentialRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "{} WHERE user_id = ?1 AND (?2 IS NULL OR organization_id = ?2) ORDER BY created_at, id",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![user_id, organization_id], RawRow::from_row)
            .context("Failed to execute query")?
            .collect::<rusqlite::Result<Vec<RawRow>>>()
            .context("Failed to read results")?;

        // A malformed row must not hide the owner's other credentials
        let records = rows
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id.clone();
                match raw.into_record() {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(record_id = %id, error = %e, "Skipping malformed credential row");
                        None
                    }
                }
            })
            .collect();

        Ok(records)
    }

    fn update_rotation(&self, update: &RotationUpdate) -> Result<bool> {
        let platform_metadata = serde_json::to_string(&PlatformMetadata::new(&update.metadata))
            .context("Failed to serialize platform_metadata")?;

        let rows_affected = self
            .lock()?
            .execute(
                r#"
                UPDATE credential_accounts SET
                    access_token = ?1,
                    refresh_token = ?2,
                    token_expires_at = ?3,
                    status = 'connected',
                    rotation_count = ?4,
                    platform_metadata = ?5,
                    updated_at = ?6
                WHERE id = ?7 AND rotation_count = ?8 AND status != 'disconnected'
                "#,
                params![
                    blob_json(Some(&update.access_token))?,
                    blob_json(update.refresh_token.as_ref())?,
                    update.metadata.expires_at.to_rfc3339(),
                    update.metadata.rotation_count,
                    platform_metadata,
                    update.updated_at.to_rfc3339(),
                    update.id,
                    update.expected_rotation_count,
                ],
            )
            .context("Failed to write rotated credentials")?;

        Ok(rows_affected > 0)
    }

    fn set_status(&self, id: &str, status: CredentialStatus, updated_at: DateTime<Utc>) -> Result<bool> {
        let rows_affected = self
            .lock()?
            .execute(
                "UPDATE credential_accounts SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status != 'disconnected'",
                params![status.as_str(), updated_at.to_rfc3339(), id],
            )
            .context("Failed to update credential status")?;

        Ok(rows_affected > 0)
    }

    fn revoke(&self, id: &str, revoked_at: DateTime<Utc>, reason: &str) -> Result<bool> {
        let revoked_at = revoked_at.to_rfc3339();
        let rows_affected = self
            .lock()?
            .execute(
                r#"
                UPDATE credential_accounts SET
                    status = 'disconnected',
                    access_token = NULL,
                    refresh_token = NULL,
                    token_expires_at = NULL,
                    platform_metadata = json_set(
                        platform_metadata,
                        '$.revokedAt', ?2,
                        '$.revocationReason', ?3
                    ),
                    updated_at = ?2
                WHERE id = ?1 AND status != 'disconnected'
                "#,
                params![id, revoked_at, reason],
            )
            .context("Failed to revoke credential")?;

        Ok(rows_affected > 0)
    }
}
