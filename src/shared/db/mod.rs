pub mod access;
pub mod migrations;
pub mod models;
pub mod records;
pub mod schema;

use diesel::{
    connection::SimpleConnection,
    r2d2::{ConnectionManager, CustomizeConnection, Pool},
    sqlite::SqliteConnection,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

pub use access::DBAccessManager;

use crate::shared::config::{LifecycleConfig, StorageConfig};
use crate::shared::errors::{AppError, AppResult};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

#[derive(Debug)]
struct ConnectionTuning;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionTuning {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA synchronous = FULL;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub fn sqlite_pool(database_url: &str, size: u32) -> AppResult<SqlitePool> {
    let manager = ConnectionManager::<SqliteConnection>::new(database_url);
    Pool::builder()
        .max_size(size.max(1))
        .connection_timeout(Duration::from_secs(5))
        .test_on_check_out(false)
        .connection_customizer(Box::new(ConnectionTuning))
        .build(manager)
        .map_err(|e| AppError::Configuration(format!("store '{}': {}", database_url, e)))
}

/// Durable backing of the engine's tables.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("pool", &self.pool.state()).finish()
    }
}

impl Store {
    /// Opens the database file and brings its schema up to date.
    pub async fn open(database_url: &str, pool_size: u32) -> AppResult<Store> {
        let url = database_url.to_string();
        let pool = tokio::task::spawn_blocking(move || -> AppResult<SqlitePool> {
            let pool = sqlite_pool(&url, pool_size)?;
            let mut conn = pool
                .get()
                .map_err(|e| AppError::from_pool_err(e, "While opening store:"))?;
            let version = migrations::run(&mut conn)?;
            log::info!("store open at '{}' (schema version {})", url, version);
            Ok(pool)
        })
        .await
        .map_err(|e| AppError::Internal(format!("store open task: {}", e)))??;
        Ok(Store { pool })
    }

    /// Runs blocking database work off the async workers.
    pub async fn run<T, F>(&self, work: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut DBAccessManager) -> AppResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| AppError::from_pool_err(e, "While getting a connection:"))?;
            let mut db = DBAccessManager::new(conn);
            work(&mut db)
        })
        .await
        .map_err(|e| AppError::Internal(format!("store task: {}", e)))?
    }
}

/// A service's handle on the store. Without one the service is volatile:
/// writes are skipped and nothing is loaded back.
#[derive(Debug, Clone, Default)]
pub struct Persistence(Option<Store>);

impl Persistence {
    pub fn new(store: Store) -> Self {
        Persistence(Some(store))
    }

    pub fn is_durable(&self) -> bool {
        self.0.is_some()
    }

    pub async fn write<F>(&self, work: F) -> AppResult<()>
    where
        F: FnOnce(&mut DBAccessManager) -> AppResult<()> + Send + 'static,
    {
        match &self.0 {
            Some(store) => store.run(work).await,
            None => Ok(()),
        }
    }

    pub async fn load<T, F>(&self, work: F) -> AppResult<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut DBAccessManager) -> AppResult<Vec<T>> + Send + 'static,
    {
        match &self.0 {
            Some(store) => store.run(work).await,
            None => Ok(Vec::new()),
        }
    }
}

/// Storage features available to this process, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Time/space chunking of the readings table.
    pub chunking: bool,
    /// Chunk-granular retention. Needs chunking.
    pub retention: bool,
    /// Columnar compression of aged chunks. Needs chunking and a threshold
    /// shorter than the retention horizon.
    pub compression: bool,
}

impl Capabilities {
    pub fn detect(storage: &StorageConfig, lifecycle: &LifecycleConfig) -> Capabilities {
        let chunking = storage.time_series;
        if !chunking {
            log::warn!(
                "time-series partitioning unavailable: readings stay in one segment per partition, \
                 retention and compression are disabled"
            );
        }

        let compression_fits = lifecycle.compression_after() < lifecycle.retention_horizon();
        if chunking && !compression_fits {
            log::warn!(
                "compression disabled: threshold of {} days is not below the {} day retention horizon",
                lifecycle.compression_after_days,
                lifecycle.retention_days
            );
        }

        let caps = Capabilities {
            chunking,
            retention: chunking,
            compression: chunking && compression_fits,
        };

        log::info!("storage capabilities: {:?}", caps);
        caps
    }
}

/// Monotonic id source for one table.
#[derive(Debug)]
pub struct IdSequence(AtomicI64);

impl IdSequence {
    pub fn new() -> Self {
        IdSequence(AtomicI64::new(1))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves the sequence past an id loaded from the store.
    pub fn observe(&self, id: i64) {
        self.0.fetch_max(id + 1, Ordering::Relaxed);
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}
