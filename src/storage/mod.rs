//! Local persistent state of the bot.
//!
//! A [`StoreHandle`] owns everything the bot keeps between runs:
//!
//! ```text
//! <store_path>/
//! ├── lock      exclusive OS lock, one process per store
//! ├── session   JSON: login session (user, device, tokens) and sync token
//! └── sqlite/   matrix-sdk state and encryption key store
//!     └── matrix-sdk-crypto.sqlite3   Olm account and device keys
//! ```
//!
//! plus the relational bot database named by `storage.database`.
//!
//! Opening is idempotent: reopening a store resumes its session, sync token
//! and encryption keys.

mod database;
mod state;

use std::{
    fmt,
    fs::{File, OpenOptions, TryLockError},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info, warn};
use matrix_sdk::authentication::matrix;
use tokio::{fs, sync::Mutex, time};

use crate::storage::database::{Database, DatabaseUri};
#[cfg(test)]
pub(crate) use crate::storage::state::tests::create_mock_matrix_session;
use crate::{error::BootstrapError, storage::state::PersistedState};

const LOCK_FILE: &str = "lock";
const SESSION_FILE: &str = "session";
const SQLITE_DIR: &str = "sqlite";
/// Database file of the matrix-sdk crypto store, inside [`SQLITE_DIR`]
const CRYPTO_STORE_FILE: &str = "matrix-sdk-crypto.sqlite3";

/// Handle on an open store.
///
/// Cheap to clone; all clones share the same lock, which is released when the
/// last clone is dropped or closed.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store_path", &self.inner.store_path)
            .field("database", &self.inner.database_uri)
            .finish_non_exhaustive()
    }
}

struct StoreInner {
    store_path: PathBuf,
    session_path: PathBuf,
    sqlite_path: PathBuf,
    database_uri: DatabaseUri,
    database: Database,
    state: Mutex<PersistedState>,
    /// Held for the lifetime of the handle
    _lock: File,
}

impl StoreHandle {
    /// Opens the store at `store_path` and the database at `database_uri`.
    ///
    /// The connection string is validated before anything touches the disk.
    /// `store_path` is created if absent. When a later step fails, times out
    /// or is cancelled, whatever this call created is removed again.
    ///
    /// # Arguments
    ///
    /// * `store_path` - Directory of the store, created if absent.
    /// * `database_uri` - `sqlite://<path>` or `postgres://...` connection string.
    /// * `timeout` - Upper bound for taking the lock and opening the database.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::StoreUnavailable`] if the connection string is
    /// malformed, the directory cannot be created or written, another process
    /// holds the store, the session file is corrupted, or the database cannot
    /// be opened in time.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let store = StoreHandle::open(
    ///     Path::new("/var/lib/edubot/store"),
    ///     "sqlite:///var/lib/edubot/bot.db",
    ///     Duration::from_secs(30),
    /// )
    /// .await?;
    /// ```
    pub async fn open(
        store_path: &Path,
        database_uri: &str,
        timeout: Duration,
    ) -> Result<StoreHandle, BootstrapError> {
        let database_uri = DatabaseUri::parse(database_uri)?;
        info!(
            "open store at {} with database {}",
            store_path.display(),
            database_uri
        );

        let lock_path = store_path.join(LOCK_FILE);
        let cleanup = CreatedPaths {
            dir: topmost_missing(store_path),
            lock: (store_path.is_dir() && !lock_path.exists()).then_some(lock_path),
        };
        prepare_directory(store_path).await?;

        let result = match time::timeout(
            timeout,
            StoreHandle::open_in(store_path, database_uri, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BootstrapError::StoreUnavailable(format!(
                "{} could not be opened within {:?}",
                store_path.display(),
                timeout
            ))),
        };

        if result.is_ok() {
            cleanup.keep();
        }
        result
    }

    async fn open_in(
        store_path: &Path,
        database_uri: DatabaseUri,
        timeout: Duration,
    ) -> Result<StoreHandle, BootstrapError> {
        let lock = acquire_lock(&store_path.join(LOCK_FILE))?;

        let session_path = store_path.join(SESSION_FILE);
        let state = PersistedState::load(&session_path).await?;
        debug!(
            "found device {:?} and sync token {:?}",
            state.device_id(),
            state.sync_token
        );

        let database = Database::open(&database_uri, timeout).await?;
        debug!("database schema version {}", database.migration_version().await?);

        Ok(StoreHandle {
            inner: Arc::new(StoreInner {
                store_path: store_path.to_path_buf(),
                session_path,
                sqlite_path: store_path.join(SQLITE_DIR),
                database_uri,
                database,
                state: Mutex::new(state),
                _lock: lock,
            }),
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.inner.store_path
    }

    /// Directory of the matrix-sdk state and encryption store.
    pub fn sqlite_path(&self) -> &Path {
        &self.inner.sqlite_path
    }

    /// Tells whether the encryption store holds an Olm account.
    ///
    /// A missing crypto store means the keys of the persisted device are gone,
    /// even when the session file still names it.
    pub fn has_crypto_store(&self) -> bool {
        self.inner.sqlite_path.join(CRYPTO_STORE_FILE).is_file()
    }

    /// Returns the persisted login session, if any.
    pub async fn user_session(&self) -> Option<matrix::MatrixSession> {
        self.inner.state.lock().await.user_session.clone()
    }

    /// Returns the device whose encryption keys this store holds, if any.
    pub async fn device_id(&self) -> Option<String> {
        self.inner.state.lock().await.device_id()
    }

    /// Returns the sync token to resume from, if any.
    pub async fn sync_token(&self) -> Option<String> {
        self.inner.state.lock().await.sync_token.clone()
    }

    /// Persists the sync token to disk, keeping the login session.
    pub async fn persist_sync_token(&self, sync_token: String) -> Result<(), BootstrapError> {
        let mut state = self.inner.state.lock().await;
        let mut updated = state.clone();
        updated.sync_token = Some(sync_token);

        updated.save(&self.inner.session_path).await?;
        *state = updated;
        Ok(())
    }

    /// Persists the login session to disk.
    ///
    /// The sync token is kept when the device is unchanged and dropped otherwise.
    pub async fn persist_user_session(
        &self,
        user_session: &matrix::MatrixSession,
    ) -> Result<(), BootstrapError> {
        let mut state = self.inner.state.lock().await;
        let same_device = state.device_id().as_deref() == Some(user_session.meta.device_id.as_str());

        let updated = PersistedState {
            user_session: Some(user_session.clone()),
            sync_token: if same_device {
                state.sync_token.clone()
            } else {
                None
            },
        };

        updated.save(&self.inner.session_path).await?;
        *state = updated;
        Ok(())
    }

    /// Releases this handle. The database connections and the lock are
    /// released once every clone is gone.
    pub async fn close(self) {
        if let Some(inner) = Arc::into_inner(self.inner) {
            info!("close store at {}", inner.store_path.display());
            inner.database.close().await;
        }
    }
}

/// Paths created by an open that has not succeeded yet.
///
/// Dropping it removes them, so a failed, timed out or cancelled open leaves
/// the disk as it found it.
struct CreatedPaths {
    /// Topmost directory created for the store
    dir: Option<PathBuf>,
    /// Lock file created in a directory that already existed
    lock: Option<PathBuf>,
}

impl CreatedPaths {
    fn keep(mut self) {
        self.dir = None;
        self.lock = None;
    }
}

impl Drop for CreatedPaths {
    fn drop(&mut self) {
        // Runs on cancellation too, so no async here
        if let Some(dir) = self.dir.take() {
            debug!("remove partially created store {}", dir.display());
            if let Err(e) = std::fs::remove_dir_all(&dir)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("failed to remove {}: {}", dir.display(), e);
            }
        }
        if let Some(lock) = self.lock.take() {
            debug!("remove lock file {}", lock.display());
            if let Err(e) = std::fs::remove_file(&lock)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("failed to remove {}: {}", lock.display(), e);
            }
        }
    }
}

/// Returns the topmost ancestor of `store_path` that does not exist yet.
fn topmost_missing(store_path: &Path) -> Option<PathBuf> {
    store_path
        .ancestors()
        .take_while(|ancestor| !ancestor.as_os_str().is_empty() && !ancestor.exists())
        .last()
        .map(Path::to_path_buf)
}

/// Makes sure `store_path` is a writable directory, creating it if needed.
async fn prepare_directory(store_path: &Path) -> Result<(), BootstrapError> {
    match fs::metadata(store_path).await {
        Ok(metadata) if metadata.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(BootstrapError::StoreUnavailable(format!(
                "{} is not a directory",
                store_path.display()
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(BootstrapError::StoreUnavailable(format!(
                "cannot access {}: {e}",
                store_path.display()
            )));
        }
    }

    debug!("create store directory {}", store_path.display());
    fs::create_dir_all(store_path).await.map_err(|e| {
        BootstrapError::StoreUnavailable(format!("cannot create {}: {e}", store_path.display()))
    })
}

/// Takes the exclusive lock of a store, without waiting.
///
/// The lock is an OS file lock, so it is released by the kernel when the
/// process dies.
fn acquire_lock(lock_path: &Path) -> Result<File, BootstrapError> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .map_err(|e| {
            BootstrapError::StoreUnavailable(format!("cannot write {}: {e}", lock_path.display()))
        })?;

    match file.try_lock() {
        Ok(()) => {}
        Err(TryLockError::WouldBlock) => {
            return Err(BootstrapError::StoreUnavailable(format!(
                "store is in use by another process ({} is locked)",
                lock_path.display()
            )));
        }
        Err(TryLockError::Error(e)) => {
            return Err(BootstrapError::StoreUnavailable(format!(
                "cannot lock {}: {e}",
                lock_path.display()
            )));
        }
    }

    // Owner pid, for whoever finds the store locked
    file.set_len(0)
        .and_then(|_| writeln!(file, "{}", std::process::id()))
        .map_err(|e| {
            BootstrapError::StoreUnavailable(format!("cannot write {}: {e}", lock_path.display()))
        })?;

    Ok(file)
}
