//! Database migrations

use rusqlite::Connection;

use crate::Result;

/// Run all migrations on the database
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(super::schema::SCHEMA)?;
    Ok(())
}
