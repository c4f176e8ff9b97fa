use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use relay_core::{Comment, CommentId, Level, LevelId, Snapshot, VoteTally};
use rusqlite::{params, Connection};
use tracing::{info, instrument};

use crate::error::StoreError;
use crate::schema;
use crate::PersistentStore;

/// Relational adapter: one table per collection, rewritten inside a single
/// transaction on every commit.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        init_schema(&conn)?;

        info!(path = %path.display(), "sqlite store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(schema::CREATE_TABLES)
        .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    if version.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [schema::SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
    }
    Ok(())
}

impl PersistentStore for SqliteStore {
    #[instrument(skip(self))]
    fn load_all(&self) -> Result<Snapshot, StoreError> {
        let conn = self.conn.lock();
        let mut state = Snapshot::default();

        let mut stmt = conn.prepare(
            "SELECT id, content, timestamp, origin, upvotes, downvotes
             FROM comments ORDER BY position",
        )?;
        state.comments = stmt
            .query_map([], |row| {
                Ok(Comment {
                    id: CommentId::from_raw(row.get::<_, String>(0)?),
                    content: row.get(1)?,
                    timestamp: row.get(2)?,
                    origin: row.get(3)?,
                    upvotes: row.get::<_, i64>(4)?.max(0) as u64,
                    downvotes: row.get::<_, i64>(5)?.max(0) as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT id, name, payload FROM levels ORDER BY position")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (id, name, payload) in rows {
            let payload = serde_json::from_str(&payload)
                .map_err(|e| StoreError::Corrupted(format!("level {id} payload: {e}")))?;
            state.items.push(Level {
                id: LevelId::from_raw(id),
                name,
                payload,
            });
        }

        let mut stmt = conn.prepare("SELECT level_id, up, down FROM vote_tallies")?;
        let tallies = stmt
            .query_map([], |row| {
                Ok((
                    LevelId::from_raw(row.get::<_, String>(0)?),
                    VoteTally {
                        up: row.get::<_, i64>(1)?.max(0) as u64,
                        down: row.get::<_, i64>(2)?.max(0) as u64,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        state.vote_tallies.extend(tallies);

        Ok(state)
    }

    #[instrument(skip_all, fields(
        comments = state.comments.len(),
        items = state.items.len(),
    ))]
    fn commit(&self, state: &Snapshot) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM comments", [])?;
        tx.execute("DELETE FROM levels", [])?;
        tx.execute("DELETE FROM vote_tallies", [])?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO comments (position, id, content, timestamp, origin, upvotes, downvotes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (position, c) in state.comments.iter().enumerate() {
                insert.execute(params![
                    position as i64,
                    c.id.as_str(),
                    c.content,
                    c.timestamp,
                    c.origin,
                    c.upvotes as i64,
                    c.downvotes as i64,
                ])?;
            }

            let mut insert = tx.prepare(
                "INSERT INTO levels (position, id, name, payload) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, level) in state.items.iter().enumerate() {
                let payload = serde_json::to_string(&level.payload)?;
                insert.execute(params![position as i64, level.id.as_str(), level.name, payload])?;
            }

            let mut insert =
                tx.prepare("INSERT INTO vote_tallies (level_id, up, down) VALUES (?1, ?2, ?3)")?;
            for (level_id, tally) in &state.vote_tallies {
                insert.execute(params![level_id.as_str(), tally.up as i64, tally.down as i64])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
