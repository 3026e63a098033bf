use std::path::Path;
use std::str::FromStr;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Connection, SqliteConnection};
use tokio::sync::mpsc;

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu, SqliteSchemaSnafu,
    SqliteThreadSpawnSnafu, StorageResult,
};
use super::{KeyValueStore, validate_key};

const CREATE_KV_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

type Reply<T> = std_mpsc::Sender<StorageResult<T>>;

enum KvCommand {
    Get {
        key: String,
        reply: Reply<Option<String>>,
    },
    Set {
        key: String,
        value: String,
        reply: Reply<()>,
    },
    Remove {
        key: String,
        reply: Reply<()>,
    },
}

/// Key-value records in a single SQLite table.
///
/// One worker thread owns the connection for the lifetime of the store and
/// serves the sync trait calls in order. Clones share that worker; it stops
/// once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    database_url: String,
    commands: mpsc::UnboundedSender<KvCommand>,
}

impl SqliteKeyValueStore {
    /// Opens (creating if needed) the database file and the key-value table.
    pub fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let worker_url = database_url.clone();
        // Sync callers may sit on a thread that already drives a runtime, so the
        // connection lives on its own thread with a current-thread runtime.
        std::thread::Builder::new()
            .name("sqlite-kv-worker".to_string())
            .spawn(move || run_worker(worker_url, connect_options, command_rx, ready_tx))
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-open-spawn-worker",
            })?;

        match ready_rx.recv() {
            Ok(opened) => opened?,
            Err(_) => return worker_gone("sqlite-open-await-worker"),
        }

        tracing::debug!(database_url = %database_url, "opened sqlite key-value store");
        Ok(Self {
            database_url,
            commands: command_tx,
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn call<T>(
        &self,
        stage: &'static str,
        command: impl FnOnce(Reply<T>) -> KvCommand,
    ) -> StorageResult<T> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        if self.commands.send(command(reply_tx)).is_err() {
            return worker_gone(stage);
        }

        reply_rx.recv().unwrap_or_else(|_| worker_gone(stage))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        validate_key(key, "kv-get")?;
        self.call("kv-get", |reply| KvCommand::Get {
            key: key.to_string(),
            reply,
        })
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        validate_key(key, "kv-set")?;
        self.call("kv-set", |reply| KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            reply,
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        validate_key(key, "kv-remove")?;
        self.call("kv-remove", |reply| KvCommand::Remove {
            key: key.to_string(),
            reply,
        })
    }
}

fn worker_gone<T>(stage: &'static str) -> StorageResult<T> {
    InvariantViolationSnafu {
        stage,
        details: "sqlite key-value worker is not running".to_string(),
    }
    .fail()
}

fn run_worker(
    database_url: String,
    connect_options: SqliteConnectOptions,
    mut commands: mpsc::UnboundedReceiver<KvCommand>,
    ready: std_mpsc::Sender<StorageResult<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context(SqliteRuntimeInitSnafu {
            stage: "sqlite-kv-runtime-build",
        }) {
        Ok(runtime) => runtime,
        Err(error) => {
            let _ = ready.send(Err(error));
            return;
        }
    };

    runtime.block_on(async move {
        let mut connection = match open_connection(&database_url, &connect_options).await {
            Ok(connection) => connection,
            Err(error) => {
                let _ = ready.send(Err(error));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        while let Some(command) = commands.recv().await {
            match command {
                KvCommand::Get { key, reply } => {
                    let _ = reply.send(select_value(&mut connection, key).await);
                }
                KvCommand::Set { key, value, reply } => {
                    let _ = reply.send(upsert_value(&mut connection, key, value).await);
                }
                KvCommand::Remove { key, reply } => {
                    let _ = reply.send(delete_value(&mut connection, key).await);
                }
            }
        }

        if let Err(error) = connection.close().await {
            tracing::warn!(database_url = %database_url, error = %error, "failed to close sqlite connection");
        }
        tracing::debug!(database_url = %database_url, "sqlite key-value worker stopped");
    });
}

async fn open_connection(
    database_url: &str,
    connect_options: &SqliteConnectOptions,
) -> StorageResult<SqliteConnection> {
    let mut connection = SqliteConnection::connect_with(connect_options)
        .await
        .context(SqliteConnectSnafu {
            stage: "sqlite-open-connect",
            database_url: database_url.to_string(),
        })?;

    sqlx::query(CREATE_KV_TABLE_SQL)
        .execute(&mut connection)
        .await
        .context(SqliteSchemaSnafu {
            stage: "sqlite-open-create-kv-table",
        })?;

    Ok(connection)
}

async fn select_value(
    connection: &mut SqliteConnection,
    key: String,
) -> StorageResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
        .bind(key)
        .fetch_optional(connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "kv-get-select",
        })
}

async fn upsert_value(
    connection: &mut SqliteConnection,
    key: String,
    value: String,
) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(unix_timestamp_seconds())
    .execute(connection)
    .await
    .context(SqliteQuerySnafu {
        stage: "kv-set-upsert",
    })?;
    Ok(())
}

async fn delete_value(connection: &mut SqliteConnection, key: String) -> StorageResult<()> {
    sqlx::query("DELETE FROM kv_entries WHERE key = ?")
        .bind(key)
        .execute(connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "kv-remove-delete",
        })?;
    Ok(())
}

fn unix_timestamp_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_secs() as i64)
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_store() -> (tempfile::TempDir, SqliteKeyValueStore) {
        let directory = tempfile::tempdir().unwrap();
        let database_path = directory.path().join("nested").join("state.db");
        let store = SqliteKeyValueStore::open(database_path.to_str().unwrap()).unwrap();
        (directory, store)
    }

    #[test]
    fn normalizes_plain_paths_into_sqlite_urls() {
        assert_eq!(
            normalize_database_url("/tmp/parley/state.db"),
            "sqlite:///tmp/parley/state.db"
        );
        assert_eq!(
            normalize_database_url("sqlite://already.db"),
            "sqlite://already.db"
        );
    }

    #[test]
    fn upsert_overwrites_existing_values() {
        let (_directory, store) = open_temp_store();

        assert_eq!(store.get("active_conversation_id").unwrap(), None);
        store.set("active_conversation_id", "first").unwrap();
        store.set("active_conversation_id", "second").unwrap();
        assert_eq!(
            store.get("active_conversation_id").unwrap().as_deref(),
            Some("second")
        );

        store.remove("active_conversation_id").unwrap();
        assert_eq!(store.get("active_conversation_id").unwrap(), None);
    }

    #[test]
    fn clones_share_one_worker_across_threads() {
        let (_directory, store) = open_temp_store();

        let writers = (0..4)
            .map(|index| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for round in 0..10 {
                        store
                            .set(&format!("writer-{index}"), &round.to_string())
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for writer in writers {
            writer.join().unwrap();
        }

        for index in 0..4 {
            assert_eq!(
                store.get(&format!("writer-{index}")).unwrap().as_deref(),
                Some("9")
            );
        }
    }

    #[test]
    fn values_survive_reopening_the_database() {
        let directory = tempfile::tempdir().unwrap();
        let database_path = directory.path().join("state.db");
        let location = database_path.to_str().unwrap();

        SqliteKeyValueStore::open(location)
            .unwrap()
            .set("conversations", "[]")
            .unwrap();

        let reopened = SqliteKeyValueStore::open(location).unwrap();
        assert_eq!(reopened.get("conversations").unwrap().as_deref(), Some("[]"));
    }
}
