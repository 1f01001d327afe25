//! SQLite schema DDL and migration framework.

use rusqlite::Connection;

use crate::errors::IsgResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 1;

/// Core DDL statements: 9 CREATE TABLE + 10 CREATE INDEX + the cache epoch
/// seed.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (9) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS repo_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        source_text TEXT NOT NULL,
        parse_error_count INTEGER NOT NULL DEFAULT 0,
        last_indexed_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS nodes (
        id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL REFERENCES files(path) ON DELETE CASCADE,
        module_path TEXT NOT NULL,
        symbol TEXT NOT NULL,
        kind TEXT NOT NULL,
        level TEXT NOT NULL,
        owner_id TEXT REFERENCES nodes(id) ON DELETE CASCADE,
        signature TEXT NOT NULL,
        exact_signature TEXT,
        hydrated_signature TEXT,
        confidence REAL NOT NULL,
        content_hash TEXT NOT NULL,
        parse_error_count INTEGER NOT NULL DEFAULT 0,
        start_byte INTEGER NOT NULL,
        end_byte INTEGER NOT NULL,
        start_line INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        CHECK ((level = 'L1') = (owner_id IS NULL)),
        CHECK (confidence >= 0.0 AND confidence <= 1.0)
    );",
    "CREATE TABLE IF NOT EXISTS edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        provenance TEXT NOT NULL,
        weight REAL NOT NULL DEFAULT 1.0,
        file_path TEXT NOT NULL,
        UNIQUE(source_id, target_id, kind, file_path)
    );",
    "CREATE TABLE IF NOT EXISTS blobs (
        node_id TEXT PRIMARY KEY REFERENCES nodes(id) ON DELETE CASCADE,
        code TEXT NOT NULL,
        recovered INTEGER NOT NULL DEFAULT 0,
        classification TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS diagnostics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        severity TEXT NOT NULL,
        code TEXT,
        message TEXT NOT NULL,
        file_path TEXT NOT NULL,
        start_line INTEGER NOT NULL,
        start_col INTEGER NOT NULL,
        end_line INTEGER NOT NULL,
        end_col INTEGER NOT NULL,
        analyzer_revision TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS embeddings (
        node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
        encoder TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        vector BLOB NOT NULL,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY(node_id, encoder)
    );",
    "CREATE TABLE IF NOT EXISTS mutations (
        node_id TEXT PRIMARY KEY,
        file_path TEXT NOT NULL,
        current_code TEXT,
        future_code TEXT,
        future_action TEXT NOT NULL DEFAULT 'none',
        current_present INTEGER NOT NULL DEFAULT 0,
        future_present INTEGER NOT NULL DEFAULT 0,
        classification TEXT NOT NULL DEFAULT 'implementation',
        preflight_state TEXT NOT NULL DEFAULT 'none',
        diagnostics_json TEXT NOT NULL DEFAULT '[]',
        validated_base_hash TEXT,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS ingestion_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        file_path TEXT,
        stage TEXT NOT NULL,
        category TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (10) ────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_nodes_file ON nodes(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_nodes_symbol ON nodes(symbol);",
    "CREATE INDEX IF NOT EXISTS idx_nodes_owner ON nodes(owner_id);",
    "CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);",
    "CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);",
    "CREATE INDEX IF NOT EXISTS idx_edges_file ON edges(file_path);",
    "CREATE INDEX IF NOT EXISTS idx_diagnostics_node ON diagnostics(node_id);",
    "CREATE INDEX IF NOT EXISTS idx_embeddings_encoder ON embeddings(encoder, content_hash);",
    "CREATE INDEX IF NOT EXISTS idx_mutations_action ON mutations(future_action);",
    "CREATE INDEX IF NOT EXISTS idx_ingestion_events_run ON ingestion_events(run_id, created_at);",
    // ── seed ────────────────────────────────────────────────────────────
    "INSERT INTO repo_meta(key, value) VALUES('cache_epoch', '1') \
     ON CONFLICT(key) DO NOTHING;",
];

/// Steps after the baseline, as `(target version, DDL)`. Version 1 is the
/// baseline laid down by [`SCHEMA_STATEMENTS`].
const MIGRATION_STEPS: &[(i32, &str)] = &[];

const MIGRATION_HISTORY_STATEMENT: &str = "CREATE TABLE IF NOT EXISTS migration_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_version INTEGER NOT NULL,
    to_version INTEGER NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);";

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> IsgResult<()> {
    conn.execute_batch(MIGRATION_HISTORY_STATEMENT)?;
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT isg_migrate_step;")?;

        let step_result = (|| -> IsgResult<()> {
            if let Some((_, ddl)) = MIGRATION_STEPS.iter().find(|(v, _)| *v == next_version) {
                conn.execute_batch(ddl)?;
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT isg_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT isg_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT isg_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `repo_meta`.
/// Returns 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM repo_meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> IsgResult<()> {
    conn.execute(
        "INSERT INTO repo_meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> IsgResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        for stmt in SCHEMA_STATEMENTS {
            conn.execute_batch(stmt).unwrap();
        }
        conn
    }

    #[test]
    fn test_schema_statement_counts() {
        assert_eq!(SCHEMA_STATEMENTS.len(), 20);
    }

    #[test]
    fn test_migrate_fresh_database() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let epoch: String = conn
            .query_row(
                "SELECT value FROM repo_meta WHERE key = 'cache_epoch';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(epoch, "1");
    }

    #[test]
    fn test_migrate_idempotent() {
        let conn = fresh();
        migrate_schema(&conn).unwrap();
        migrate_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        let steps: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM migration_history WHERE status = 'success';",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(steps, SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_facet_without_owner_is_rejected() {
        let conn = fresh();
        conn.execute(
            "INSERT INTO files(path, content_hash, source_text) VALUES ('a.rs', 'h', '');",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO nodes(id, file_path, module_path, symbol, kind, level, owner_id, \
             signature, confidence, content_hash, start_byte, end_byte, start_line, end_line) \
             VALUES ('a.rs|S::x|field|0', 'a.rs', '', 'S::x', 'field', 'L2', NULL, \
             'x: u8', 0.5, 'h', 0, 1, 1, 1);",
            [],
        );
        assert!(result.is_err());
    }
}
