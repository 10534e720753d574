//! SQLite tenant store
//!
//! Two tables: `tenants` (one row per tenant) and `watermarks` (one row per
//! announced `(item, tenant)` pair). Every public write is a single statement
//! or a single transaction, so callers never need a transaction spanning a
//! whole cycle.

use super::models::{NotificationMode, TenantConfig, TenantEdit, TenantSetup, Watermark};
use crate::credentials::{hash_credential, upgrade_stored, CredentialHash};
use crate::ids::{ChannelId, ItemId, MentionId, TenantId};
use crate::{HeraldError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database file
    pub path: PathBuf,

    /// Enable WAL mode so status reads don't block the scheduler's writes
    pub wal_mode: bool,

    /// How long a statement waits on a locked database before failing
    pub busy_timeout: Duration,
}

impl StoreConfig {
    /// Config for a database at `path` with default settings
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("herald");
        path.push("herald.db");

        Self {
            path,
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// What store initialization had to migrate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Tenants imported from the legacy `guilds` table
    pub legacy_tenants: usize,

    /// Watermarks imported from the legacy `published_posts` table
    pub legacy_watermarks: usize,

    /// Stored credentials re-hashed into the current format
    pub credentials_upgraded: usize,
}

/// Durable tenant configuration and watermark store
pub struct TenantStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    migration: MigrationReport,
}

impl TenantStore {
    /// Open or create the store database
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!(path = %config.path.display(), "Opening tenant store");

        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(config.busy_timeout)?;
        if config.wal_mode {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        Self::initialize(conn, Some(config.path.clone()))
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?, None)
    }

    fn initialize(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let mut store = Self {
            conn: Mutex::new(conn),
            path,
            migration: MigrationReport::default(),
        };

        store.init_schema()?;
        let (legacy_tenants, legacy_watermarks) = store.import_legacy_tables()?;
        let credentials_upgraded = store.migrate_credentials()?;

        store.migration = MigrationReport {
            legacy_tenants,
            legacy_watermarks,
            credentials_upgraded,
        };

        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HeraldError::Storage("tenant store connection poisoned".to_string()))
    }

    /// Database path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Migrations applied when this store was opened
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                source_endpoint TEXT,
                source_credential TEXT,
                notifications_enabled INTEGER NOT NULL DEFAULT 0,
                destination_channel TEXT,
                mention_target TEXT,
                mode TEXT NOT NULL DEFAULT 'new_and_updated',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS watermarks (
                item_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                published_at INTEGER NOT NULL,
                last_seen_updated_at INTEGER NOT NULL,
                PRIMARY KEY (item_id, tenant_id),
                FOREIGN KEY (tenant_id) REFERENCES tenants(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_watermarks_tenant ON watermarks(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_watermarks_updated ON watermarks(last_seen_updated_at);
            "#,
        )?;

        Ok(())
    }

    /// Import rows from the `guilds`/`published_posts` tables older
    /// deployments used, then drop them. One transaction.
    fn import_legacy_tables(&self) -> Result<(usize, usize)> {
        let mut conn = self.conn()?;

        if !table_exists(&conn, "guilds")? {
            return Ok((0, 0));
        }

        let columns = table_columns(&conn, "guilds")?;
        let has = |name: &str| columns.iter().any(|c| c == name);

        // Two generations: (apiUrl, pingRole) and (url, roleId, announcementsEnabled)
        let endpoint_col = if has("url") { "url" } else { "apiUrl" };
        let mention_col = if has("roleId") { "roleId" } else { "pingRole" };
        let enabled_expr = if has("announcementsEnabled") {
            "announcementsEnabled"
        } else {
            "CASE WHEN channelId IS NULL THEN 0 ELSE 1 END"
        };
        let created_expr = if has("createdAt") { "createdAt" } else { "NULL" };

        tracing::info!(
            endpoint_column = endpoint_col,
            "Importing tenants from legacy guilds table"
        );

        let tx = conn.transaction()?;
        let now = now_millis();

        let rows: Vec<LegacyGuild> = {
            let sql = format!(
                "SELECT id, {endpoint_col}, apiKey, {enabled_expr}, channelId, {mention_col}, mode, {created_expr} FROM guilds"
            );
            let mut stmt = tx.prepare(&sql)?;
            let mapped = stmt.query_map([], |row| {
                Ok(LegacyGuild {
                    id: row.get(0)?,
                    endpoint: row.get(1)?,
                    api_key: row.get(2)?,
                    enabled: row.get::<_, Option<i64>>(3)?.unwrap_or(0) != 0,
                    channel: row.get(4)?,
                    mention: row.get(5)?,
                    mode: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        for guild in &rows {
            let mode = guild
                .mode
                .as_deref()
                .and_then(|m| m.parse::<NotificationMode>().ok())
                .unwrap_or_default();
            // Enabled without a channel would violate the tenant invariant
            let enabled = guild.enabled && guild.channel.is_some();

            tx.execute(
                r#"
                INSERT OR IGNORE INTO tenants (
                    id, source_endpoint, source_credential, notifications_enabled,
                    destination_channel, mention_target, mode, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    guild.id,
                    guild.endpoint,
                    guild.api_key,
                    enabled,
                    guild.channel,
                    guild.mention,
                    mode.as_str(),
                    guild.created_at.unwrap_or(now),
                    now,
                ],
            )?;
        }

        let watermarks = if table_exists(&tx, "published_posts")? {
            let imported = tx.execute(
                r#"
                INSERT OR IGNORE INTO watermarks (item_id, tenant_id, published_at, last_seen_updated_at)
                SELECT postId, guildId, COALESCE(publishedAt, 0), COALESCE(updatedAt, 0)
                FROM published_posts
                WHERE guildId IN (SELECT id FROM tenants)
                "#,
                [],
            )?;
            tx.execute("DROP TABLE published_posts", [])?;
            imported
        } else {
            0
        };

        tx.execute("DROP TABLE guilds", [])?;
        tx.commit()?;

        tracing::info!(
            tenants = rows.len(),
            watermarks = watermarks,
            "Legacy import complete"
        );

        Ok((rows.len(), watermarks))
    }

    /// Re-hash stored credentials that are plaintext or in an old hash format
    ///
    /// Runs in one transaction: a crash leaves either every old value or every
    /// migrated value.
    pub fn migrate_credentials(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let pending: Vec<(String, CredentialHash)> = {
            let mut stmt = tx.prepare(
                "SELECT id, source_credential FROM tenants WHERE source_credential IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut pending = Vec::new();
            for row in rows {
                let (id, stored) = row?;
                if let Some(upgraded) = upgrade_stored(&stored) {
                    pending.push((id, upgraded));
                }
            }
            pending
        };

        if pending.is_empty() {
            return Ok(0);
        }

        tracing::info!(count = pending.len(), "Migrating stored credentials to hashed format");

        let now = now_millis();
        for (id, hash) in &pending {
            tx.execute(
                "UPDATE tenants SET source_credential = ?1, updated_at = ?2 WHERE id = ?3",
                params![hash.as_str(), now, id],
            )?;
        }
        tx.commit()?;

        tracing::info!("Credential migration complete");
        Ok(pending.len())
    }

    /// Get a tenant's configuration
    pub fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<TenantConfig>> {
        let conn = self.conn()?;
        let tenant = conn
            .query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![tenant_id.as_str()],
                tenant_from_row,
            )
            .optional()?;
        Ok(tenant)
    }

    /// Get a tenant's configuration or fail with `TenantNotFound`
    pub fn require_tenant(&self, tenant_id: &TenantId) -> Result<TenantConfig> {
        self.get_tenant(tenant_id)?
            .ok_or_else(|| HeraldError::TenantNotFound(tenant_id.to_string()))
    }

    /// All tenants, ordered by id
    pub fn list_tenants(&self) -> Result<Vec<TenantConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY id"))?;
        let tenants = stmt
            .query_map([], tenant_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tenants)
    }

    /// Create or fully replace a tenant's configuration
    ///
    /// The credential is hashed here; `created_at` survives a re-setup.
    pub fn put_tenant(&self, tenant_id: &TenantId, setup: &TenantSetup) -> Result<TenantConfig> {
        if setup.notifications_enabled && setup.destination_channel.is_none() {
            return Err(HeraldError::Validation(
                "a destination channel is required when notifications are enabled".to_string(),
            ));
        }

        let hash = hash_credential(&setup.credential);
        let now = now_millis();

        self.conn()?.execute(
            r#"
            INSERT INTO tenants (
                id, source_endpoint, source_credential, notifications_enabled,
                destination_channel, mention_target, mode, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(id) DO UPDATE SET
                source_endpoint = excluded.source_endpoint,
                source_credential = excluded.source_credential,
                notifications_enabled = excluded.notifications_enabled,
                destination_channel = excluded.destination_channel,
                mention_target = excluded.mention_target,
                mode = excluded.mode,
                updated_at = excluded.updated_at
            "#,
            params![
                tenant_id.as_str(),
                &setup.source_endpoint,
                hash.as_str(),
                setup.notifications_enabled,
                setup.destination_channel.as_ref().map(ChannelId::as_str),
                setup.mention_target.as_ref().map(MentionId::as_str),
                setup.mode.as_str(),
                now,
            ],
        )?;

        tracing::debug!(tenant_id = %tenant_id, "Stored tenant configuration");
        self.require_tenant(tenant_id)
    }

    /// Update exactly one field plus `updated_at`
    pub fn apply_edit(&self, tenant_id: &TenantId, edit: &TenantEdit) -> Result<TenantConfig> {
        let now = now_millis();
        let id = tenant_id.as_str();

        let changed = {
            let conn = self.conn()?;
            match edit {
                TenantEdit::SourceEndpoint(url) => conn.execute(
                    "UPDATE tenants SET source_endpoint = ?1, updated_at = ?2 WHERE id = ?3",
                    params![url, now, id],
                )?,
                TenantEdit::SourceCredential(secret) => {
                    let hash = hash_credential(secret);
                    conn.execute(
                        "UPDATE tenants SET source_credential = ?1, updated_at = ?2 WHERE id = ?3",
                        params![hash.as_str(), now, id],
                    )?
                }
                TenantEdit::Destination(channel) => conn.execute(
                    "UPDATE tenants SET destination_channel = ?1, updated_at = ?2 WHERE id = ?3",
                    params![channel.as_str(), now, id],
                )?,
                TenantEdit::Mention(mention) => conn.execute(
                    "UPDATE tenants SET mention_target = ?1, updated_at = ?2 WHERE id = ?3",
                    params![mention.as_ref().map(MentionId::as_str), now, id],
                )?,
                TenantEdit::Mode(mode) => conn.execute(
                    "UPDATE tenants SET mode = ?1, updated_at = ?2 WHERE id = ?3",
                    params![mode.as_str(), now, id],
                )?,
                TenantEdit::NotificationsEnabled(true) => conn.execute(
                    "UPDATE tenants SET notifications_enabled = 1, updated_at = ?1 \
                     WHERE id = ?2 AND destination_channel IS NOT NULL",
                    params![now, id],
                )?,
                TenantEdit::NotificationsEnabled(false) => conn.execute(
                    "UPDATE tenants SET notifications_enabled = 0, updated_at = ?1 WHERE id = ?2",
                    params![now, id],
                )?,
            }
        };

        if changed == 0 {
            let exists = self.get_tenant(tenant_id)?.is_some();
            return Err(if exists {
                HeraldError::Validation(
                    "a destination channel must be set before notifications can be enabled"
                        .to_string(),
                )
            } else {
                HeraldError::TenantNotFound(tenant_id.to_string())
            });
        }

        tracing::debug!(tenant_id = %tenant_id, field = edit.field_name(), "Updated tenant field");
        self.require_tenant(tenant_id)
    }

    /// Remove a tenant and all of its watermarks
    ///
    /// Returns the removed configuration, `None` if there was nothing to remove.
    pub fn remove_tenant(&self, tenant_id: &TenantId) -> Result<Option<TenantConfig>> {
        let existing = match self.get_tenant(tenant_id)? {
            Some(t) => t,
            None => return Ok(None),
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let watermarks = tx.execute(
            "DELETE FROM watermarks WHERE tenant_id = ?1",
            params![tenant_id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM tenants WHERE id = ?1",
            params![tenant_id.as_str()],
        )?;
        tx.commit()?;

        tracing::info!(tenant_id = %tenant_id, watermarks = watermarks, "Removed tenant");
        Ok(Some(existing))
    }

    /// Look up the watermark for one item of one tenant
    pub fn get_watermark(&self, item_id: &ItemId, tenant_id: &TenantId) -> Result<Option<Watermark>> {
        let conn = self.conn()?;
        let watermark = conn
            .query_row(
                r#"
                SELECT item_id, tenant_id, published_at, last_seen_updated_at
                FROM watermarks WHERE item_id = ?1 AND tenant_id = ?2
                "#,
                params![item_id.as_str(), tenant_id.as_str()],
                watermark_from_row,
            )
            .optional()?;
        Ok(watermark)
    }

    /// Insert or overwrite one watermark
    pub fn upsert_watermark(&self, watermark: &Watermark) -> Result<()> {
        let conn = self.conn()?;
        upsert_watermark_on(&conn, watermark)?;
        Ok(())
    }

    /// Upsert many watermarks of one tenant in a single transaction
    pub fn backfill_watermarks(&self, tenant_id: &TenantId, watermarks: &[Watermark]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut written = 0;
        for watermark in watermarks.iter().filter(|w| &w.tenant_id == tenant_id) {
            upsert_watermark_on(&tx, watermark)?;
            written += 1;
        }
        tx.commit()?;
        Ok(written)
    }

    /// Number of watermarks a tenant has
    pub fn watermark_count(&self, tenant_id: &TenantId) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM watermarks WHERE tenant_id = ?1",
            params![tenant_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

struct LegacyGuild {
    id: String,
    endpoint: Option<String>,
    api_key: Option<String>,
    enabled: bool,
    channel: Option<String>,
    mention: Option<String>,
    mode: Option<String>,
    created_at: Option<i64>,
}

const TENANT_COLUMNS: &str = "id, source_endpoint, source_credential, notifications_enabled, \
     destination_channel, mention_target, mode, created_at, updated_at";

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<TenantConfig> {
    let mode_str: String = row.get(6)?;
    let mode = mode_str.parse::<NotificationMode>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(TenantConfig {
        id: TenantId::new(row.get::<_, String>(0)?),
        source_endpoint: row.get(1)?,
        source_credential: row
            .get::<_, Option<String>>(2)?
            .map(CredentialHash::from_stored),
        notifications_enabled: row.get::<_, i64>(3)? != 0,
        destination_channel: row.get::<_, Option<String>>(4)?.map(ChannelId::new),
        mention_target: row.get::<_, Option<String>>(5)?.map(MentionId::new),
        mode,
        created_at: millis_to_datetime(row.get(7)?),
        updated_at: millis_to_datetime(row.get(8)?),
    })
}

fn watermark_from_row(row: &Row<'_>) -> rusqlite::Result<Watermark> {
    Ok(Watermark {
        item_id: ItemId::new(row.get::<_, String>(0)?),
        tenant_id: TenantId::new(row.get::<_, String>(1)?),
        published_at: millis_to_datetime(row.get(2)?),
        last_seen_updated_at: millis_to_datetime(row.get(3)?),
    })
}

fn upsert_watermark_on(conn: &Connection, watermark: &Watermark) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO watermarks (item_id, tenant_id, published_at, last_seen_updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(item_id, tenant_id) DO UPDATE SET
            published_at = excluded.published_at,
            last_seen_updated_at = excluded.last_seen_updated_at
        "#,
        params![
            watermark.item_id.as_str(),
            watermark.tenant_id.as_str(),
            watermark.published_at.timestamp_millis(),
            watermark.last_seen_updated_at.timestamp_millis(),
        ],
    )
}

fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}
