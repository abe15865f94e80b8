use async_trait::async_trait;
use blotter_types::{
    ErrorText, LeaseRecord, LinkStatus, LinkUpdate, NewLink, NewWorkflowEvent, NodeIdentity,
    PresenceRecord, PriorityEntry, SystemCode, TradeSystemLink, WorkflowEvent,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::store::{LeaseStore, LinkStore, PresenceStore, PriorityStore, WorkflowEventLog};
use crate::StoreError;

const MIGRATIONS: [(&str, &str); 5] = [
    (
        "001_create_presence",
        include_str!("../migrations/001_create_presence.sql"),
    ),
    (
        "002_create_master_priority",
        include_str!("../migrations/002_create_master_priority.sql"),
    ),
    (
        "003_create_master_lock",
        include_str!("../migrations/003_create_master_lock.sql"),
    ),
    (
        "004_create_trade_system_link",
        include_str!("../migrations/004_create_trade_system_link.sql"),
    ),
    (
        "005_create_trade_workflow_event",
        include_str!("../migrations/005_create_trade_workflow_event.sql"),
    ),
];

// ═══════════════════════════════════════════════════════════════════════════
// SQLITE STORE IMPLEMENTATION
// ═══════════════════════════════════════════════════════════════════════════

/// Store backed by one SQLite database shared by every blotter instance
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `db_path`
    pub async fn new<P: AsRef<Path>>(
        db_path: P,
        max_connections: u32,
        busy_timeout: std::time::Duration,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        info!(path = %db_path.as_ref().display(), "Opened shared blotter database");

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Connect using a sqlx URL such as `sqlite://blotter.db?mode=rwc`
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options =
            SqliteConnectOptions::from_str(url).map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing)
    pub async fn in_memory() -> Result<Self, StoreError> {
        // Every pooled connection would otherwise see its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<(), StoreError> {
        for (name, script) in MIGRATIONS {
            for statement in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::DatabaseError(format!("{name}: {e}")))?;
            }
            debug!(migration = name, "Applied migration");
        }

        Ok(())
    }

    fn row_to_presence(row: &SqliteRow) -> Result<PresenceRecord, StoreError> {
        Ok(PresenceRecord {
            node_id: row.try_get("node_id")?,
            user_name: row.try_get("user_name")?,
            machine_name: row.try_get("machine_name")?,
            last_seen_utc: from_millis(row.try_get("last_seen_utc")?)?,
        })
    }

    fn row_to_lease(row: &SqliteRow) -> Result<LeaseRecord, StoreError> {
        Ok(LeaseRecord {
            lock_name: row.try_get("lock_name")?,
            held_by_user: row.try_get("held_by_user")?,
            held_by_machine: row.try_get("held_by_machine")?,
            last_heartbeat_utc: from_millis(row.try_get("last_heartbeat_utc")?)?,
            expires_at_utc: from_millis(row.try_get("expires_at_utc")?)?,
        })
    }

    /// Convert database row to TradeSystemLink; unknown codes are an error
    fn row_to_link(row: &SqliteRow) -> Result<TradeSystemLink, StoreError> {
        let system_code: SystemCode = row.try_get::<String, _>("system_code")?.parse()?;
        let status: LinkStatus = row.try_get::<String, _>("status")?.parse()?;

        Ok(TradeSystemLink {
            link_id: row.try_get("link_id")?,
            trade_id: row.try_get("trade_id")?,
            system_code,
            status,
            external_trade_id: row.try_get("external_trade_id")?,
            last_status_utc: opt_from_millis(row.try_get("last_status_utc")?)?,
            last_error: row.try_get("last_error")?,
            book_flag: row.try_get("book_flag")?,
            stp_mode: row.try_get("stp_mode")?,
            booked_by: row.try_get("booked_by")?,
            first_booked_utc: opt_from_millis(row.try_get("first_booked_utc")?)?,
            last_booked_utc: opt_from_millis(row.try_get("last_booked_utc")?)?,
            is_deleted: row.try_get("is_deleted")?,
        })
    }

    fn row_to_event(row: &SqliteRow) -> Result<WorkflowEvent, StoreError> {
        let system_code = row
            .try_get::<Option<String>, _>("system_code")?
            .map(|code| code.parse::<SystemCode>())
            .transpose()?;

        Ok(WorkflowEvent {
            event_id: row.try_get("event_id")?,
            trade_id: row.try_get("trade_id")?,
            timestamp_utc: from_millis(row.try_get("timestamp_utc")?)?,
            event_type: row.try_get::<String, _>("event_type")?.parse()?,
            system_code,
            user_id: row.try_get("user_id")?,
            details: row.try_get("details")?,
        })
    }
}

#[async_trait]
impl PresenceStore for SqliteStore {
    async fn record_heartbeat(
        &self,
        identity: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO presence (user_name, node_id, machine_name, last_seen_utc)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_name) DO UPDATE SET
                node_id = excluded.node_id,
                machine_name = excluded.machine_name,
                last_seen_utc = excluded.last_seen_utc
            "#,
        )
        .bind(&identity.user_name)
        .bind(&identity.node_id)
        .bind(&identity.machine_name)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_online_users(
        &self,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Vec<String>, StoreError> {
        let cutoff = (now - ttl).timestamp_millis();
        let rows = sqlx::query(
            "SELECT DISTINCT user_name FROM presence WHERE last_seen_utc > ? ORDER BY user_name",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get("user_name").map_err(StoreError::from))
            .collect()
    }

    async fn list_presence(&self) -> Result<Vec<PresenceRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM presence ORDER BY user_name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_presence).collect()
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn try_acquire_lease(
        &self,
        lock_name: &str,
        candidate: &NodeIdentity,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now_ms = now.timestamp_millis();
        let expires_ms = (now + ttl).timestamp_millis();

        // The conflict branch only fires for an expired lease or a renewal
        let result = sqlx::query(
            r#"
            INSERT INTO master_lock (
                lock_name, held_by_user, held_by_machine, last_heartbeat_utc, expires_at_utc
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(lock_name) DO UPDATE SET
                held_by_user = excluded.held_by_user,
                held_by_machine = excluded.held_by_machine,
                last_heartbeat_utc = excluded.last_heartbeat_utc,
                expires_at_utc = excluded.expires_at_utc
            WHERE master_lock.expires_at_utc < ?
               OR (master_lock.held_by_user = ? AND master_lock.held_by_machine = ?)
            "#,
        )
        .bind(lock_name)
        .bind(&candidate.user_name)
        .bind(&candidate.machine_name)
        .bind(now_ms)
        .bind(expires_ms)
        .bind(now_ms)
        .bind(&candidate.user_name)
        .bind(&candidate.machine_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_current_master(
        &self,
        lock_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM master_lock WHERE lock_name = ? AND expires_at_utc > ?")
            .bind(lock_name)
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_lease).transpose()
    }

    async fn get_lease(&self, lock_name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM master_lock WHERE lock_name = ?")
            .bind(lock_name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_lease).transpose()
    }

    async fn release_lease(
        &self,
        lock_name: &str,
        holder: &NodeIdentity,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE master_lock SET expires_at_utc = ?
            WHERE lock_name = ? AND held_by_user = ? AND held_by_machine = ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(lock_name)
        .bind(&holder.user_name)
        .bind(&holder.machine_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl PriorityStore for SqliteStore {
    async fn load_priority_list(&self) -> Result<Vec<PriorityEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM master_priority ORDER BY order_no ASC, user_name ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(PriorityEntry {
                    user_name: row.try_get("user_name")?,
                    order_no: row.try_get("order_no")?,
                })
            })
            .collect()
    }

    async fn set_priority(&self, user_name: &str, order_no: i32) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO master_priority (user_name, order_no) VALUES (?, ?)
            ON CONFLICT(user_name) DO UPDATE SET order_no = excluded.order_no
            "#,
        )
        .bind(user_name)
        .bind(order_no)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_priority(&self, user_name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM master_priority WHERE user_name = ?")
            .bind(user_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl LinkStore for SqliteStore {
    async fn insert_link(&self, link: &NewLink) -> Result<TradeSystemLink, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_system_link (trade_id, system_code, status, book_flag, stp_mode, is_deleted)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(link.trade_id)
        .bind(link.system_code.as_str())
        .bind(LinkStatus::New.as_str())
        .bind(link.book_flag)
        .bind(&link.stp_mode)
        .execute(&self.pool)
        .await;

        let link_id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::DuplicateLink {
                    trade_id: link.trade_id,
                    system_code: link.system_code,
                })
            }
            Err(e) => return Err(e.into()),
        };

        self.get_link(link_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("link {link_id}")))
    }

    async fn get_link(&self, link_id: i64) -> Result<Option<TradeSystemLink>, StoreError> {
        let row = sqlx::query("SELECT * FROM trade_system_link WHERE link_id = ?")
            .bind(link_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_link).transpose()
    }

    async fn find_link(
        &self,
        trade_id: i64,
        system_code: SystemCode,
    ) -> Result<Option<TradeSystemLink>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM trade_system_link
            WHERE trade_id = ? AND system_code = ? AND is_deleted = 0
            "#,
        )
        .bind(trade_id)
        .bind(system_code.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_link).transpose()
    }

    async fn list_links_for_trade(
        &self,
        trade_id: i64,
    ) -> Result<Vec<TradeSystemLink>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_system_link WHERE trade_id = ? AND is_deleted = 0 ORDER BY link_id",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_link).collect()
    }

    async fn list_links_by_status(
        &self,
        statuses: &[LinkStatus],
        systems: &[SystemCode],
    ) -> Result<Vec<TradeSystemLink>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT * FROM trade_system_link WHERE is_deleted = 0 AND status IN ({})",
            placeholders(statuses.len())
        );
        if !systems.is_empty() {
            sql.push_str(&format!(" AND system_code IN ({})", placeholders(systems.len())));
        }
        sql.push_str(" ORDER BY link_id");

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        for system in systems {
            query = query.bind(system.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_link).collect()
    }

    async fn transition(
        &self,
        link_id: i64,
        from: &[LinkStatus],
        update: &LinkUpdate,
    ) -> Result<bool, StoreError> {
        if from.is_empty() {
            return Ok(false);
        }

        let (clear_error, set_error) = match &update.error {
            ErrorText::Keep => (false, None),
            ErrorText::Clear => (true, None),
            ErrorText::Set(text) => (false, Some(text.as_str())),
        };
        let at = update.at.timestamp_millis();

        let sql = format!(
            r#"
            UPDATE trade_system_link SET
                status = ?,
                last_status_utc = ?,
                external_trade_id = COALESCE(?, external_trade_id),
                last_error = CASE WHEN ? THEN NULL ELSE COALESCE(?, last_error) END,
                booked_by = COALESCE(?, booked_by),
                first_booked_utc = CASE WHEN ? THEN COALESCE(first_booked_utc, ?) ELSE first_booked_utc END,
                last_booked_utc = CASE WHEN ? THEN ? ELSE last_booked_utc END
            WHERE link_id = ? AND is_deleted = 0 AND status IN ({})
            "#,
            placeholders(from.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(update.status.as_str())
            .bind(at)
            .bind(update.external_trade_id.as_deref())
            .bind(clear_error)
            .bind(set_error)
            .bind(update.booked_by.as_deref())
            .bind(update.mark_booked)
            .bind(at)
            .bind(update.mark_booked)
            .bind(at)
            .bind(link_id);
        for status in from {
            query = query.bind(status.as_str());
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_deleted(&self, link_id: i64) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE trade_system_link SET is_deleted = 1 WHERE link_id = ? AND is_deleted = 0")
                .bind(link_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl WorkflowEventLog for SqliteStore {
    async fn append(&self, event: &NewWorkflowEvent) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO trade_workflow_event (
                trade_id, timestamp_utc, event_type, system_code, user_id, details
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.trade_id)
        .bind(event.timestamp_utc.timestamp_millis())
        .bind(event.event_type.as_str())
        .bind(event.system_code.map(|code| code.as_str()))
        .bind(&event.user_id)
        .bind(&event.details)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_for_trade(&self, trade_id: i64) -> Result<Vec<WorkflowEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM trade_workflow_event
            WHERE trade_id = ?
            ORDER BY timestamp_utc ASC, event_id ASC
            "#,
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<WorkflowEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_workflow_event ORDER BY timestamp_utc DESC, event_id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_event).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::SerializationError(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
