//! Program persistence: a single SQLite table keyed by `(frequency, channel, start_time)`.
//!
//! A `SCHEMA_SQL` constant creates the table on open, and the `Connection` is wrapped in a
//! `tokio::sync::Mutex` since rusqlite is synchronous and this store is called from async
//! handlers.

use std::path::Path;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::Result;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS programs (
    frequency TEXT NOT NULL,
    channel_service_id TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    event_id INTEGER,
    source_id TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (frequency, channel_service_id, start_time)
);

CREATE INDEX IF NOT EXISTS idx_programs_end_time ON programs(end_time);
"#;

/// One row of the EPG: a single program airing on one virtual channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramRow {
    pub frequency: String,
    pub channel_service_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub title: String,
    pub description: String,
    pub event_id: Option<i64>,
    pub source_id: String,
}

pub struct EpgStore {
    conn: Mutex<Connection>,
}

impl EpgStore {
    /// Whether a store already exists on disk. Used by the orchestrator's cadence rule:
    /// a present file means skip the startup deep scan.
    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or update a program row. `title`/`end_time`/`event_id`/`source_id` commute
    /// freely across repeated scans of the same frequency. `description` is passed through as
    /// given (DVB EIT carries a real description at upsert time), but an empty incoming value
    /// never clobbers an existing one — ATSC rows always upsert with an empty description, which
    /// only gets filled in later via `update_description` once the matching ETT arrives.
    pub async fn upsert_program(&self, row: &ProgramRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO programs (frequency, channel_service_id, start_time, end_time, title, description, event_id, source_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(frequency, channel_service_id, start_time) DO UPDATE SET
                end_time = excluded.end_time,
                title = excluded.title,
                description = CASE WHEN excluded.description != '' THEN excluded.description ELSE programs.description END,
                event_id = excluded.event_id,
                source_id = excluded.source_id",
            params![
                row.frequency,
                row.channel_service_id,
                row.start_time,
                row.end_time,
                row.title,
                row.description,
                row.event_id,
                row.source_id,
            ],
        )?;
        Ok(())
    }

    /// Update the description of an already-upserted program, matched by its ATSC event id.
    pub async fn update_description(
        &self,
        frequency: &str,
        channel_service_id: &str,
        event_id: i64,
        description: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE programs SET description = ?1 WHERE frequency = ?2 AND channel_service_id = ?3 AND event_id = ?4",
            params![description, frequency, channel_service_id, event_id],
        )?;
        Ok(())
    }

    /// Programs whose window contains `now`.
    pub async fn select_active(&self, now: i64) -> Result<Vec<ProgramRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT frequency, channel_service_id, start_time, end_time, title, description, event_id, source_id
             FROM programs WHERE start_time <= ?1 AND end_time > ?1",
        )?;
        let rows = stmt.query_map(params![now], row_from_sql)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Programs overlapping `[start, end)`, used by the XMLTV generator.
    pub async fn select_window(&self, start: i64, end: i64) -> Result<Vec<ProgramRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT frequency, channel_service_id, start_time, end_time, title, description, event_id, source_id
             FROM programs WHERE end_time > ?1 AND start_time < ?2 ORDER BY channel_service_id, start_time",
        )?;
        let rows = stmt.query_map(params![start, end], row_from_sql)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }
}

fn row_from_sql(row: &rusqlite::Row) -> rusqlite::Result<ProgramRow> {
    Ok(ProgramRow {
        frequency: row.get(0)?,
        channel_service_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        event_id: row.get(6)?,
        source_id: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(freq: &str, chan: &str, start: i64, end: i64, title: &str, event_id: i64) -> ProgramRow {
        ProgramRow {
            frequency: freq.to_string(),
            channel_service_id: chan.to_string(),
            start_time: start,
            end_time: end,
            title: title.to_string(),
            description: String::new(),
            event_id: Some(event_id),
            source_id: String::new(),
        }
    }

    #[test]
    fn schema_creates_programs_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(tables.contains(&"programs".to_string()));
    }

    #[tokio::test]
    async fn upsert_then_update_description_round_trips() {
        let store = EpgStore::open_in_memory().unwrap();
        store
            .upsert_program(&row("500000000", "15.1", 1000, 2000, "News", 42))
            .await
            .unwrap();
        store
            .update_description("500000000", "15.1", 42, "Tonight's headlines")
            .await
            .unwrap();

        let active = store.select_active(1500).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "News");
        assert_eq!(active[0].description, "Tonight's headlines");
    }

    #[tokio::test]
    async fn upsert_with_nonempty_description_round_trips() {
        let store = EpgStore::open_in_memory().unwrap();
        let mut dvb_row = row("177000000", "4.1", 1000, 2000, "Show", 0);
        dvb_row.description = "A synopsis".to_string();
        dvb_row.event_id = None;

        store.upsert_program(&dvb_row).await.unwrap();

        let active = store.select_active(1500).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].description, "A synopsis");
    }

    #[tokio::test]
    async fn repeated_upsert_of_same_key_overwrites_title_but_not_description() {
        let store = EpgStore::open_in_memory().unwrap();
        store
            .upsert_program(&row("500000000", "15.1", 1000, 2000, "News", 42))
            .await
            .unwrap();
        store
            .update_description("500000000", "15.1", 42, "Headlines")
            .await
            .unwrap();
        store
            .upsert_program(&row("500000000", "15.1", 1000, 2500, "News Update", 42))
            .await
            .unwrap();

        let active = store.select_active(1500).await.unwrap();
        assert_eq!(active[0].title, "News Update");
        assert_eq!(active[0].end_time, 2500);
        assert_eq!(
            active[0].description, "Headlines",
            "an upsert must not clobber a description set by ETT"
        );
    }

    #[tokio::test]
    async fn select_window_filters_by_overlap() {
        let store = EpgStore::open_in_memory().unwrap();
        store
            .upsert_program(&row("500000000", "15.1", 1000, 2000, "A", 1))
            .await
            .unwrap();
        store
            .upsert_program(&row("500000000", "15.1", 3000, 4000, "B", 2))
            .await
            .unwrap();

        let window = store.select_window(1500, 2500).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].title, "A");
    }
}
