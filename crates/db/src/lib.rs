mod error;
mod events;
mod queries;

use std::path::Path;

use rusqlite::Connection;

pub use error::{DbError, Result};
pub use events::InsertOutcome;

pub const MIGRATION_0001: &str = include_str!("../migrations/0001_init.sql");
pub const MIGRATION_0002: &str = include_str!("../migrations/0002_add_context_window.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init", MIGRATION_0001),
    ("0002_add_context_window", MIGRATION_0002),
];

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5_000))?;
        Ok(Self { conn })
    }

    /// Every statement is IF NOT EXISTS, so re-running the full set on each
    /// startup is idempotent.
    pub fn migrate(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (_name, sql) in MIGRATIONS {
            tx.execute_batch(sql)?;
        }
        tx.commit()?;
        Ok(())
    }
}
