/// xr_bridge Runtime - process-wide singleton owning the logger and the session
///
/// The runtime holds at most one live session at a time. State sits in
/// thread-safe static storage (`OnceLock` + `RwLock`), so any thread may reach
/// the session or emit log entries.

use std::sync::{Arc, OnceLock, RwLock};
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::log::{DefaultLogger, LogEntry, LogSeverity, Logger};
use crate::session::{Session, SessionCreateInfo};

// ===== INTERNAL STATE =====

/// Global runtime state storage
static RUNTIME_STATE: OnceLock<RuntimeState> = OnceLock::new();

/// Global logger (initialized with DefaultLogger)
static LOGGER: OnceLock<RwLock<Box<dyn Logger>>> = OnceLock::new();

struct RuntimeState {
    /// The one live session, if any
    session: RwLock<Option<Arc<Session>>>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            session: RwLock::new(None),
        }
    }
}

fn logger() -> &'static RwLock<Box<dyn Logger>> {
    LOGGER.get_or_init(|| RwLock::new(Box::new(DefaultLogger::default())))
}

// ===== PUBLIC API =====

/// Runtime singleton manager
///
/// # Example
///
/// ```no_run
/// use xr_bridge::bridge::Runtime;
/// # fn info() -> xr_bridge::session::SessionCreateInfo { unimplemented!() }
///
/// Runtime::initialize()?;
/// let session = Runtime::create_session(info())?;
/// // Drive the frame loop through `session`...
/// Runtime::destroy_session()?;
/// Runtime::shutdown();
/// # Ok::<(), xr_bridge::bridge::Error>(())
/// ```
pub struct Runtime;

impl Runtime {
    /// Log errors before returning them
    fn log_and_return_error(error: Error) -> Error {
        match &error {
            Error::LimitReached(msg) => {
                crate::bridge_error!("xr_bridge::Runtime", "Limit reached: {}", msg);
            }
            Error::BackendError(msg) => {
                crate::bridge_error!("xr_bridge::Runtime", "Backend error: {}", msg);
            }
            _ => {
                crate::bridge_error!("xr_bridge::Runtime", "Runtime error: {}", error);
            }
        }
        error
    }

    fn state() -> Result<&'static RuntimeState> {
        RUNTIME_STATE.get().ok_or_else(|| {
            Self::log_and_return_error(Error::RuntimeFailure(
                "Runtime not initialized. Call Runtime::initialize() first.".to_string(),
            ))
        })
    }

    /// Initialize the runtime; idempotent
    pub fn initialize() -> Result<()> {
        RUNTIME_STATE.get_or_init(RuntimeState::new);
        Ok(())
    }

    /// Destroy the live session, if any
    ///
    /// Call `initialize()` again before creating a new session.
    pub fn shutdown() {
        if let Some(state) = RUNTIME_STATE.get() {
            let session = state.session.write().ok().and_then(|mut s| s.take());
            if let Some(session) = session {
                session.destroy();
                crate::bridge_info!("xr_bridge::Runtime", "Runtime shut down");
            }
        }
    }

    /// Create the session singleton
    ///
    /// # Errors
    ///
    /// - `RuntimeFailure` if the runtime is not initialized
    /// - `LimitReached` if a session already exists
    pub fn create_session(info: SessionCreateInfo) -> Result<Arc<Session>> {
        let state = Self::state()?;
        let mut lock = state.session.write().map_err(|_| {
            Self::log_and_return_error(Error::BackendError("Session lock poisoned".to_string()))
        })?;

        if lock.is_some() {
            return Err(Self::log_and_return_error(Error::LimitReached(
                "a session already exists; destroy it first".to_string(),
            )));
        }

        let session = Arc::new(Session::new(info));
        *lock = Some(session.clone());
        crate::bridge_info!("xr_bridge::Runtime", "Session singleton created");
        Ok(session)
    }

    /// The live session
    pub fn session() -> Result<Arc<Session>> {
        let state = Self::state()?;
        let lock = state.session.read().map_err(|_| {
            Self::log_and_return_error(Error::BackendError("Session lock poisoned".to_string()))
        })?;
        lock.clone().ok_or(Error::HandleInvalid)
    }

    /// Tear down and forget the live session
    ///
    /// Outstanding `Arc<Session>` clones stay valid but their resources are released.
    pub fn destroy_session() -> Result<()> {
        let state = Self::state()?;
        let session = state
            .session
            .write()
            .map_err(|_| {
                Self::log_and_return_error(Error::BackendError("Session lock poisoned".to_string()))
            })?
            .take()
            .ok_or(Error::HandleInvalid)?;

        session.destroy();
        crate::bridge_info!("xr_bridge::Runtime", "Session singleton destroyed");
        Ok(())
    }

    /// Reset all singletons (test builds only)
    #[cfg(test)]
    pub fn reset_for_testing() {
        if let Some(state) = RUNTIME_STATE.get() {
            if let Ok(mut session) = state.session.write() {
                *session = None;
            }
        }
    }

    // ===== LOGGING API =====

    /// Replace the logger (file logger, network logger, etc.)
    ///
    /// ```no_run
    /// use xr_bridge::bridge::{Runtime, log::{Logger, LogEntry}};
    ///
    /// struct FileLogger;
    /// impl Logger for FileLogger {
    ///     fn log(&self, entry: &LogEntry) {
    ///         // Write to file...
    ///     }
    /// }
    ///
    /// Runtime::set_logger(FileLogger);
    /// ```
    pub fn set_logger<L: Logger + 'static>(logger_impl: L) {
        if let Ok(mut lock) = logger().write() {
            *lock = Box::new(logger_impl);
        }
    }

    /// Restore the console logger
    pub fn reset_logger() {
        if let Ok(mut lock) = logger().write() {
            *lock = Box::new(DefaultLogger::default());
        }
    }

    /// Log entry point used by the `bridge_*` macros
    pub fn log(severity: LogSeverity, source: &str, message: String) {
        if let Ok(lock) = logger().read() {
            lock.log(&LogEntry {
                severity,
                timestamp: SystemTime::now(),
                source: source.to_string(),
                message,
                file: None,
                line: None,
            });
        }
    }

    /// Log entry point with file:line (used by `bridge_error!` and `bridge_err!`)
    pub fn log_detailed(
        severity: LogSeverity,
        source: &str,
        message: String,
        file: &'static str,
        line: u32,
    ) {
        if let Ok(lock) = logger().read() {
            lock.log(&LogEntry {
                severity,
                timestamp: SystemTime::now(),
                source: source.to_string(),
                message,
                file: Some(file),
                line: Some(line),
            });
        }
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
