//! Persistent message store backed by SQLite.
//!
//! One connection, serialized behind a re-entrant mutex so operations that
//! call other synchronized operations (paged filter deletes resolving ids,
//! then deleting them) can nest. Multi-step mutations run through
//! [`MessageStore::with_txn`]: the outermost call opens the transaction and
//! commits or rolls back, nested calls join it.

use crate::error::{RelayError, Result};
use crate::filter::Filter;
use crate::types::{
    ClassCounts, InstanceCounts, MarkStatus, Message, MessageId, NewMessage, SenderCounts,
    Timestamp, DEFAULT_CLASS, DEFAULT_INSTANCE,
};
use fs2::FileExt;
use parking_lot::ReentrantMutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use std::cell::Cell;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Column list matching [`row_to_message`].
pub(crate) const MESSAGE_COLUMNS: &str =
    "id, sender, auth, signature, body, read, cls, instance, recipient, timestamp";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sender      TEXT    NOT NULL,
    auth        INTEGER NOT NULL DEFAULT 1,
    signature   TEXT    NOT NULL DEFAULT '',
    body        TEXT    NOT NULL,
    read        INTEGER NOT NULL DEFAULT 0,
    cls         TEXT    NOT NULL DEFAULT 'message',
    instance    TEXT    NOT NULL DEFAULT 'personal',
    recipient   TEXT    DEFAULT NULL,
    timestamp   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_cls       ON messages(cls);
CREATE INDEX IF NOT EXISTS idx_messages_instance  ON messages(cls, instance);
CREATE INDEX IF NOT EXISTS idx_messages_sender    ON messages(sender);
CREATE INDEX IF NOT EXISTS idx_messages_read      ON messages(read);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
";

struct StoreInner {
    conn: Connection,
    /// Transaction nesting depth for the lock-holding thread.
    txn_depth: Cell<u32>,
}

/// The persistent message store.
pub struct MessageStore {
    inner: ReentrantMutex<StoreInner>,
    /// Exclusive lock beside the database file, held for the store's life.
    _lock_file: Option<File>,
}

impl MessageStore {
    /// Open an existing database or create a new one.
    ///
    /// The parent directory is created if needed. A sibling `.lock` file
    /// guards against a second process opening the same store.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(path)?;

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            inner: ReentrantMutex::new(StoreInner {
                conn,
                txn_depth: Cell::new(0),
            }),
            _lock_file: Some(lock_file),
        })
    }

    /// An in-memory store, for tests and embedded use.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            inner: ReentrantMutex::new(StoreInner {
                conn,
                txn_depth: Cell::new(0),
            }),
            _lock_file: None,
        })
    }

    fn acquire_lock(db_path: &Path) -> Result<File> {
        let mut lock_path: PathBuf = db_path.to_path_buf();
        lock_path.as_mut_os_string().push(".lock");
        let file = File::create(&lock_path)?;
        file.try_lock_exclusive().map_err(|_| RelayError::Locked)?;
        Ok(file)
    }

    /// Run a read against the connection, serialized with all writers.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        f(&inner.conn)
    }

    /// Run a mutating sequence inside a transaction.
    ///
    /// The outermost call on a thread issues `BEGIN IMMEDIATE` and commits
    /// on success or rolls back on error, leaving the store exactly as it
    /// was before the sequence. Nested calls join the enclosing
    /// transaction, so an inner failure unwinds the whole sequence.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        let outermost = inner.txn_depth.get() == 0;
        if outermost {
            inner.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        inner.txn_depth.set(inner.txn_depth.get() + 1);
        let result = f(&inner.conn);
        inner.txn_depth.set(inner.txn_depth.get() - 1);
        if !outermost {
            return result;
        }
        match result {
            Ok(value) => {
                inner.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = inner.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // --- Row Operations ---

    /// Insert a message, returning its store-assigned id.
    pub fn insert(&self, message: &NewMessage) -> Result<MessageId> {
        self.with_txn(|conn| insert_on(conn, message))
    }

    /// Delete by explicit id list. Empty list and already-deleted ids are
    /// no-ops; returns the count actually removed.
    pub fn delete_ids(&self, ids: &[MessageId]) -> Result<usize> {
        self.with_txn(|conn| delete_ids_on(conn, ids))
    }

    /// Set the read flag on an explicit id list; returns the count updated.
    pub fn mark_ids(&self, status: MarkStatus, ids: &[MessageId]) -> Result<usize> {
        self.with_txn(|conn| mark_ids_on(conn, status, ids))
    }

    /// Total number of stored messages.
    pub fn count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
                .map_err(Into::into)
        })
    }

    /// True iff any message with id greater than `last` exists, optionally
    /// restricted to a filter.
    pub fn has_newer(&self, last: MessageId, filter: Option<&Filter>) -> Result<bool> {
        self.with_conn(|conn| {
            let (sql, params) = match filter {
                Some(f) => (
                    format!(
                        "SELECT EXISTS(SELECT 1 FROM messages{})",
                        f.where_with("id > ?")
                    ),
                    f.params_and(&[SqlValue::Integer(last.0)]),
                ),
                None => (
                    "SELECT EXISTS(SELECT 1 FROM messages WHERE id > ?)".to_string(),
                    vec![SqlValue::Integer(last.0)],
                ),
            };
            conn.query_row(&sql, params_from_iter(params), |row| row.get(0))
                .map_err(Into::into)
        })
    }

    // --- Grouped Views ---
    //
    // Each view returns per-group unread/total counts ordered by most
    // recent activity (descending max timestamp within the group). The
    // unread-only variants restrict to read = 0 rows first, so their
    // groups and totals cover unread messages only.

    /// Instances with messages in a class.
    pub fn instance_counts(
        &self,
        class: &str,
        unread_only: bool,
        offset: i64,
        perpage: i64,
    ) -> Result<Vec<InstanceCounts>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT instance, COALESCE(SUM(read = 0), 0) AS unread, COUNT(*) AS total \
                 FROM messages WHERE cls = ?{} \
                 GROUP BY instance ORDER BY MAX(timestamp) DESC LIMIT ? OFFSET ?",
                if unread_only { " AND read = 0" } else { "" }
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![class, perpage, offset], |row| {
                Ok(InstanceCounts {
                    instance: row.get(0)?,
                    unread: row.get(1)?,
                    total: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Classes with messages. The starred flag is left unset here; the
    /// messenger annotates it from preferences.
    pub fn class_counts(
        &self,
        unread_only: bool,
        offset: i64,
        perpage: i64,
    ) -> Result<Vec<ClassCounts>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT cls, COALESCE(SUM(read = 0), 0) AS unread, COUNT(*) AS total \
                 FROM messages{} \
                 GROUP BY cls ORDER BY MAX(timestamp) DESC LIMIT ? OFFSET ?",
                if unread_only { " WHERE read = 0" } else { "" }
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![perpage, offset], |row| {
                Ok(ClassCounts {
                    class: row.get(0)?,
                    unread: row.get(1)?,
                    total: row.get(2)?,
                    starred: false,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }

    /// Senders of personal messages (specific recipient, default
    /// class/instance).
    pub fn sender_counts(&self, offset: i64, perpage: i64) -> Result<Vec<SenderCounts>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sender, COALESCE(SUM(read = 0), 0) AS unread, COUNT(*) AS total \
                 FROM messages \
                 WHERE recipient IS NOT NULL AND cls = ? AND instance = ? \
                 GROUP BY sender ORDER BY MAX(timestamp) DESC LIMIT ? OFFSET ?",
            )?;
            let rows = stmt.query_map(
                params![DEFAULT_CLASS, DEFAULT_INSTANCE, perpage, offset],
                |row| {
                    Ok(SenderCounts {
                        sender: row.get(0)?,
                        unread: row.get(1)?,
                        total: row.get(2)?,
                    })
                },
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }
}

/// Map a `SELECT {MESSAGE_COLUMNS}` row.
pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get(0)?),
        sender: row.get(1)?,
        authenticated: row.get(2)?,
        signature: row.get(3)?,
        body: row.get(4)?,
        read: row.get(5)?,
        class: row.get(6)?,
        instance: row.get(7)?,
        recipient: row.get(8)?,
        timestamp: Timestamp(row.get(9)?),
    })
}

pub(crate) fn insert_on(conn: &Connection, message: &NewMessage) -> Result<MessageId> {
    let class = if message.class.is_empty() {
        DEFAULT_CLASS
    } else {
        &message.class
    };
    let instance = if message.instance.is_empty() {
        DEFAULT_INSTANCE
    } else {
        &message.instance
    };
    let timestamp = message.timestamp.unwrap_or_else(Timestamp::now);

    conn.execute(
        "INSERT INTO messages (sender, auth, signature, body, read, cls, instance, recipient, timestamp) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            message.sender,
            message.authenticated,
            message.signature,
            message.body,
            message.read,
            class,
            instance,
            message.recipient,
            timestamp.0,
        ],
    )?;
    Ok(MessageId(conn.last_insert_rowid()))
}

pub(crate) fn delete_ids_on(conn: &Connection, ids: &[MessageId]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!("DELETE FROM messages WHERE id IN ({})", placeholders(ids.len()));
    conn.execute(&sql, params_from_iter(ids.iter().map(|id| id.0)))
        .map_err(Into::into)
}

pub(crate) fn mark_ids_on(conn: &Connection, status: MarkStatus, ids: &[MessageId]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let sql = format!(
        "UPDATE messages SET read = {} WHERE id IN ({})",
        status.as_flag(),
        placeholders(ids.len())
    );
    conn.execute(&sql, params_from_iter(ids.iter().map(|id| id.0)))
        .map_err(Into::into)
}

fn placeholders(count: usize) -> String {
    let mut s = "?,".repeat(count);
    s.pop();
    s
}
