//! Source-of-Truth Database
//!
//! SQLite persistence for activities, status transitions, and the stock sync
//! log. The keystore fronts this store on the hot path; the synchronizer and
//! consistency validator reconcile back into it.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{Activity, ActivityStatus, StatusTransition};

#[derive(Clone)]
pub struct SaleDb {
    conn: Arc<Mutex<Connection>>,
}

impl SaleDb {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open sale db")?;
        Self::init(conn)
    }

    /// Private database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sale db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS activities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                total_stock INTEGER NOT NULL,
                sold_count INTEGER NOT NULL DEFAULT 0,
                price REAL NOT NULL,
                per_user_limit INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_activities_status ON activities(status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS status_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                reason TEXT NOT NULL,
                operator TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_status_history_activity
             ON status_history(activity_id, ts)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stock_sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                activity_id TEXT NOT NULL,
                old_stock INTEGER NOT NULL,
                new_stock INTEGER NOT NULL,
                conflict_type TEXT NOT NULL,
                policy TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_stock_sync_log_activity
             ON stock_sync_log(activity_id, ts DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_activity(row: &Row<'_>) -> rusqlite::Result<Activity> {
        let status: String = row.get("status")?;
        Ok(Activity {
            id: row.get("id")?,
            name: row.get("name")?,
            status: ActivityStatus::parse(&status).unwrap_or(ActivityStatus::Cancelled),
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            total_stock: row.get("total_stock")?,
            sold_count: row.get("sold_count")?,
            price: row.get("price")?,
            per_user_limit: row.get("per_user_limit")?,
            version: row.get("version")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub async fn upsert_activity(&self, activity: &Activity) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO activities
             (id, name, status, start_time, end_time, total_stock, sold_count,
              price, per_user_limit, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                total_stock = excluded.total_stock,
                sold_count = excluded.sold_count,
                price = excluded.price,
                per_user_limit = excluded.per_user_limit,
                version = excluded.version,
                updated_at = excluded.updated_at",
            params![
                activity.id,
                activity.name,
                activity.status.as_str(),
                activity.start_time,
                activity.end_time,
                activity.total_stock,
                activity.sold_count,
                activity.price,
                activity.per_user_limit,
                activity.version,
                activity.updated_at,
            ],
        )
        .context("upsert activity")?;
        Ok(())
    }

    pub async fn get_activity(&self, id: &str) -> Result<Option<Activity>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, start_time, end_time, total_stock, sold_count,
                    price, per_user_limit, version, updated_at
             FROM activities WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], Self::row_to_activity)?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("read activity row")?)),
            None => Ok(None),
        }
    }

    /// Activities currently in `active` status, oldest start first.
    pub async fn list_active(&self, limit: usize, offset: usize) -> Result<Vec<Activity>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, start_time, end_time, total_stock, sold_count,
                    price, per_user_limit, version, updated_at
             FROM activities WHERE status = 'active'
             ORDER BY start_time ASC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], Self::row_to_activity)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read activity row")?);
        }
        Ok(out)
    }

    /// Status write with version bump. Returns false when the row is missing.
    pub async fn update_status(
        &self,
        id: &str,
        status: ActivityStatus,
        updated_at: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE activities
                 SET status = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?1",
                params![id, status.as_str(), updated_at],
            )
            .context("update activity status")?;
        Ok(n > 0)
    }

    /// Sold-count write used by the synchronizer. Returns false on a missing row.
    pub async fn update_sold_count(
        &self,
        id: &str,
        sold_count: i64,
        updated_at: i64,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn
            .execute(
                "UPDATE activities
                 SET sold_count = ?2, version = version + 1, updated_at = ?3
                 WHERE id = ?1",
                params![id, sold_count, updated_at],
            )
            .context("update sold count")?;
        Ok(n > 0)
    }

    pub async fn record_status_transition(
        &self,
        activity_id: &str,
        transition: &StatusTransition,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO status_history
             (activity_id, from_status, to_status, reason, operator, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                activity_id,
                transition.from.as_str(),
                transition.to.as_str(),
                transition.reason,
                transition.operator,
                transition.ts,
            ],
        )
        .context("record status transition")?;
        Ok(())
    }

    pub async fn record_sync(
        &self,
        activity_id: &str,
        old_stock: i64,
        new_stock: i64,
        conflict_type: &str,
        policy: &str,
        ts: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stock_sync_log
             (activity_id, old_stock, new_stock, conflict_type, policy, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![activity_id, old_stock, new_stock, conflict_type, policy, ts],
        )
        .context("record stock sync")?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn sync_log_count(&self, activity_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stock_sync_log WHERE activity_id = ?1",
            params![activity_id],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
