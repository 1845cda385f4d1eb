use rusqlite::Connection;

/// Pragmas applied to every experiment-store connection. Foreign keys are
/// per-connection in SQLite, so they are switched on here rather than in the
/// schema.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}
