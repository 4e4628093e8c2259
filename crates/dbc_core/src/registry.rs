use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::error::DbError;
use crate::traits::{Driver, DriverConnection, RelationalConnection};
use crate::url::DbUrl;

/// Process-wide mapping from URL scheme to driver instance.
///
/// Registration is append-only and lookup scans in registration order,
/// delegating to the first driver whose `accepts_url` returns true. The
/// list is the only process-wide mutable state in the library; one lock
/// guards registration and lookup. Connects happen outside the lock so a
/// slow dial never blocks dispatch for other threads.
pub struct DriverManager {
    drivers: Mutex<Vec<Arc<dyn Driver>>>,
}

static GLOBAL: OnceLock<DriverManager> = OnceLock::new();

impl DriverManager {
    pub fn new() -> Self {
        Self {
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// The lazily-initialized process-wide registry.
    pub fn global() -> &'static DriverManager {
        GLOBAL.get_or_init(DriverManager::new)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Driver>>> {
        match self.drivers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a driver. Re-registering the same instance is harmless;
    /// a second instance for the same scheme never wins the scan.
    pub fn register(&self, driver: Arc<dyn Driver>) {
        log::info!("registering driver '{}' for scheme '{}'", driver.name(), driver.scheme());
        self.lock().push(driver);
    }

    /// Scheme tokens of every registered driver, in registration order.
    pub fn registered_schemes(&self) -> Vec<&'static str> {
        self.lock().iter().map(|d| d.scheme()).collect()
    }

    /// Bind `url` to a driver and open a connection.
    ///
    /// URL parse failures surface from here, not from driver internals, so
    /// a malformed string fails the same way whichever driver claims it.
    pub fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<DriverConnection, DbError> {
        let driver = self
            .lock()
            .iter()
            .find(|driver| driver.accepts_url(url))
            .cloned();

        let Some(driver) = driver else {
            let scheme = DbUrl::scheme_of(url).unwrap_or(url);
            return Err(DbError::DriverNotFound(scheme.to_string()));
        };

        let parsed = DbUrl::parse(url)?;
        log::debug!("dispatching {} to driver '{}'", parsed.scheme(), driver.name());
        driver.connect(&parsed, user, password)
    }

    /// `connect`, narrowed to the relational family.
    pub fn relational(
        &self,
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<Arc<dyn RelationalConnection>, DbError> {
        self.connect(url, user, password)?.into_relational()
    }
}

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}
