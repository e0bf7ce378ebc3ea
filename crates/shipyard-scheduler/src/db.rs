use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `scheduled_jobs` table (idempotent). Times are unix
/// microseconds so backoff arithmetic stays inside single statements.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id            TEXT    NOT NULL PRIMARY KEY,
            resource_id   TEXT    NOT NULL,
            [group]       TEXT    NOT NULL,
            message_name  TEXT    NOT NULL,
            message_data  TEXT    NOT NULL,   -- JSON-encoded request
            queued_at     INTEGER NOT NULL,
            not_before    INTEGER NOT NULL,
            error_code    TEXT,               -- last failure, NULL when none
            policy        INTEGER NOT NULL DEFAULT 0,
            retrieved     INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- Claim pass: per-group minimum over eligible rows.
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_group
            ON scheduled_jobs ([group], not_before);

        -- Merge lookups and resource-wide waits.
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_resource
            ON scheduled_jobs (resource_id, message_name);
        ",
    )?;
    Ok(())
}
