//! SQLite schema for the events store.
//!
//! Versions:
//! - 1: `events` table, single-column indexes, `(user_id, occurred_at)` and
//!   `(event_type, occurred_at)` composites.
//! - 2: `(occurred_at, user_id)` and `(occurred_at, event_type)` composites
//!   for range scans that group by user or type.
//! - 3: `occurred_at` widened from millisecond to microsecond text.

use rusqlite::{Connection, OptionalExtension, Result};

/// Current schema version. Increment when adding a migration.
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema.
///
/// Creates the tables on a fresh database and runs any pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        migrate_v1_to_v2(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Version 1 layout.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            event_id TEXT PRIMARY KEY,
            occurred_at TEXT NOT NULL,
            user_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}'
        );

        CREATE INDEX IF NOT EXISTS idx_events_occurred_at ON events(occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_user_id ON events(user_id);
        CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type);
        CREATE INDEX IF NOT EXISTS idx_events_user_occurred ON events(user_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_events_type_occurred ON events(event_type, occurred_at);
        "#,
    )?;

    Ok(())
}

fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        match version {
            1 => migrate_v1_to_v2(conn)?,
            2 => migrate_v2_to_v3(conn)?,
            _ => {}
        }
    }
    set_schema_version(conn, to)?;
    Ok(())
}

/// Migrate from v1 to v2: time-leading composite indexes.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_events_occurred_user ON events(occurred_at, user_id);
        CREATE INDEX IF NOT EXISTS idx_events_occurred_type ON events(occurred_at, event_type);
        "#,
    )?;

    tracing::info!("Migrated events schema from v1 to v2");
    Ok(())
}

/// Migrate from v2 to v3: `...SS.mmmZ` becomes `...SS.mmm000Z` so every row
/// has the same width as the range bounds.
fn migrate_v2_to_v3(conn: &Connection) -> Result<()> {
    let widened = conn.execute(
        "UPDATE events
         SET occurred_at = substr(occurred_at, 1, 23) || '000Z'
         WHERE length(occurred_at) = 24",
        [],
    )?;

    tracing::info!(rows = widened, "Migrated events schema from v2 to v3");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'events' AND name LIKE 'idx_%' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_gets_current_version() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let indexes = index_names(&conn);
        assert_eq!(indexes.len(), 7);
        assert!(indexes.contains(&"idx_events_occurred_user".to_string()));
    }

    #[test]
    fn test_init_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_v1_database_is_migrated() {
        let conn = Connection::open_in_memory().unwrap();
        get_schema_version(&conn).unwrap();
        create_tables(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();
        assert_eq!(index_names(&conn).len(), 5);

        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(index_names(&conn).contains(&"idx_events_occurred_type".to_string()));
    }

    #[test]
    fn test_v2_millisecond_timestamps_are_widened() {
        let conn = Connection::open_in_memory().unwrap();
        get_schema_version(&conn).unwrap();
        create_tables(&conn).unwrap();
        migrate_v1_to_v2(&conn).unwrap();
        set_schema_version(&conn, 2).unwrap();
        conn.execute(
            "INSERT INTO events (event_id, occurred_at, user_id, event_type)
             VALUES ('a', '2024-02-01T10:00:00.250Z', 'u', 'click'),
                    ('b', '2024-02-01T10:00:00.250123Z', 'u', 'click')",
            [],
        )
        .unwrap();

        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 3);
        let stamps: Vec<String> = conn
            .prepare("SELECT occurred_at FROM events ORDER BY event_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            stamps,
            vec!["2024-02-01T10:00:00.250000Z", "2024-02-01T10:00:00.250123Z"]
        );
    }
}
