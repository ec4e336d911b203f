use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::account::{EventEffect, LockoutPolicy, SecurityEvent, User};
use crate::repository::{UserCounts, UserRepository};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("database directory error: {0}")]
    Io(#[from] std::io::Error),
}

const USER_COLUMNS: &str = "id, username, password_hash, face_encoding, failed_attempts, locked_until,
     active_session_token, requires_password_reset, backup_code_hash, backup_code_ciphertext,
     is_admin, created_at";

/// SQLite-backed user store.
///
/// Security transitions run inside `BEGIN IMMEDIATE` transactions, so two
/// concurrent attempts for one user never interleave their read and write.
#[derive(Clone)]
pub struct SqliteUserStore {
    conn: Connection,
}

impl SqliteUserStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 CREATE TABLE IF NOT EXISTS users (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     username TEXT NOT NULL UNIQUE,
                     password_hash TEXT NOT NULL,
                     face_encoding TEXT,
                     failed_attempts INTEGER NOT NULL DEFAULT 0,
                     locked_until TEXT,
                     active_session_token TEXT,
                     requires_password_reset INTEGER NOT NULL DEFAULT 0,
                     backup_code_hash TEXT,
                     backup_code_ciphertext BLOB,
                     is_admin INTEGER NOT NULL DEFAULT 0,
                     created_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let locked_until = row
        .get::<_, Option<String>>(5)?
        .map(|t| parse_timestamp(5, &t))
        .transpose()?;
    let created_at = parse_timestamp(11, &row.get::<_, String>(11)?)?;

    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        face_encoding: row.get(3)?,
        failed_attempts: row.get(4)?,
        locked_until,
        active_session_token: row.get(6)?,
        requires_password_reset: row.get(7)?,
        backup_code_hash: row.get(8)?,
        backup_code_ciphertext: row.get(9)?,
        is_admin: row.get(10)?,
        created_at,
    })
}

fn select_user(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        row_to_user,
    )
    .optional()
}

fn write_user(conn: &rusqlite::Connection, user: &User) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE users SET
             password_hash = ?2, face_encoding = ?3, failed_attempts = ?4, locked_until = ?5,
             active_session_token = ?6, requires_password_reset = ?7, backup_code_hash = ?8,
             backup_code_ciphertext = ?9, is_admin = ?10
         WHERE id = ?1",
        rusqlite::params![
            user.id,
            user.password_hash,
            user.face_encoding,
            user.failed_attempts,
            user.locked_until.map(|t| t.to_rfc3339()),
            user.active_session_token,
            user.requires_password_reset,
            user.backup_code_hash,
            user.backup_code_ciphertext,
            user.is_admin,
        ],
    )
}

#[async_trait]
impl UserRepository for SqliteUserStore {
    async fn create_user(
        &self,
        username: &str,
        password_hash: &str,
        is_admin: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, StoreError> {
        let username = username.to_string();
        let password_hash = password_hash.to_string();
        let created_at = now.to_rfc3339();

        self.conn
            .call(move |conn| {
                let inserted = conn.execute(
                    "INSERT INTO users (username, password_hash, is_admin, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![username, password_hash, is_admin, created_at],
                );
                match inserted {
                    Ok(_) => {}
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
                let id = conn.last_insert_rowid();
                Ok(select_user(conn, id)?)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn load_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.conn
            .call(move |conn| Ok(select_user(conn, id)?))
            .await
            .map_err(StoreError::from)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let username = username.to_string();
        self.conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                        [&username],
                        row_to_user,
                    )
                    .optional()?)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        let user = user.clone();
        self.conn
            .call(move |conn| {
                write_user(conn, &user)?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn list_users_with_face(&self, exclude_id: i64) -> Result<Vec<(i64, String)>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, face_encoding FROM users
                     WHERE face_encoding IS NOT NULL AND id != ?1
                     ORDER BY id",
                )?;
                let rows = stmt.query_map([exclude_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn counts(&self) -> Result<UserCounts, StoreError> {
        self.conn
            .call(|conn| {
                let (users, faces_registered) = conn.query_row(
                    "SELECT COUNT(*), COUNT(face_encoding) FROM users",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(UserCounts {
                    users,
                    faces_registered,
                })
            })
            .await
            .map_err(StoreError::from)
    }

    async fn apply_security_event(
        &self,
        id: i64,
        event: SecurityEvent,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<(User, EventEffect)>, StoreError> {
        let policy = *policy;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let Some(mut user) = select_user(&tx, id)? else {
                    return Ok(None);
                };
                let effect = user.apply(event, &policy, now);
                if effect == EventEffect::Applied {
                    write_user(&tx, &user)?;
                }
                tx.commit()?;
                Ok(Some((user, effect)))
            })
            .await
            .map_err(StoreError::from)
    }

    async fn set_face_encoding(&self, id: i64, encoding_json: &str) -> Result<bool, StoreError> {
        let encoding_json = encoding_json.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET face_encoding = ?2 WHERE id = ?1 AND face_encoding IS NULL",
                    rusqlite::params![id, encoding_json],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn store_backup_code(&self, id: i64, hash: &str, ciphertext: &[u8]) -> Result<bool, StoreError> {
        let hash = hash.to_string();
        let ciphertext = ciphertext.to_vec();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET backup_code_hash = ?2, backup_code_ciphertext = ?3 WHERE id = ?1",
                    rusqlite::params![id, hash, ciphertext],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn consume_backup_code(&self, id: i64, hash: &str) -> Result<bool, StoreError> {
        let hash = hash.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET backup_code_hash = NULL, backup_code_ciphertext = NULL
                     WHERE id = ?1 AND backup_code_hash = ?2",
                    rusqlite::params![id, hash],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn take_backup_code_ciphertext(&self, id: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let ciphertext: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT backup_code_ciphertext FROM users WHERE id = ?1",
                        [id],
                        |row| row.get(0),
                    )
                    .optional()?
                    .flatten();
                if ciphertext.is_some() {
                    tx.execute(
                        "UPDATE users SET backup_code_ciphertext = NULL WHERE id = ?1",
                        [id],
                    )?;
                }
                tx.commit()?;
                Ok(ciphertext)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn open_session(&self, id: i64, token: &str) -> Result<bool, StoreError> {
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET active_session_token = ?2
                     WHERE id = ?1 AND active_session_token IS NULL",
                    rusqlite::params![id, token],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn close_session(&self, id: i64, token: &str) -> Result<bool, StoreError> {
        let token = token.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET active_session_token = NULL
                     WHERE id = ?1 AND active_session_token = ?2",
                    rusqlite::params![id, token],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<bool, StoreError> {
        let password_hash = password_hash.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE users SET password_hash = ?2, requires_password_reset = 0 WHERE id = ?1",
                    rusqlite::params![id, password_hash],
                )?;
                Ok(n > 0)
            })
            .await
            .map_err(StoreError::from)
    }
}
