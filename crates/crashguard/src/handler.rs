//! The crash handler lifecycle.
//!
//! A [`CrashHandler`] is registered once per process. Every exception raised on any thread is
//! delivered to [`CrashHandler::handle_fault`] on the faulting thread, which moves through the
//! following [`Phase`]s:
//!
//! ```text
//! Idle -> Classifying -> Reporting -> Displaying -> Idle
//! ```
//!
//! Reporting and Displaying happen under the alert gate: while one thread writes its artifacts
//! and waits for the user to dismiss the alert, faults on other threads are parked. A fault
//! raised by the thread holding the gate is passed on immediately.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use chrono::Local;

use crate::classify::{Classification, Classifier};
use crate::config::Config;
use crate::dump::{ArtifactPaths, write_dump};
use crate::error::Error;
use crate::platform::Platform;
use crate::report::Report;
use crate::types::FaultEvent;

/// What the interceptor tells the OS after looking at a fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Keep searching for a handler. This is the only outcome: the crash handler observes
    /// faults but never resolves them.
    ContinueSearch,
}

impl Disposition {
    /// The raw value returned from the OS callback (`EXCEPTION_CONTINUE_SEARCH`).
    pub const fn as_raw(self) -> i32 {
        match self {
            Disposition::ContinueSearch => 0,
        }
    }
}

/// The phase a fault is in while it is being handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Classifying,
    Reporting,
    Displaying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Classifying => "classifying",
            Phase::Reporting => "reporting",
            Phase::Displaying => "displaying",
        };
        f.write_str(name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panic on the fault path must not disable the handler for good
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes reporting across threads.
///
/// Holds the id of the thread currently reporting, if any.
#[derive(Debug, Default)]
pub struct AlertGate {
    owner: Mutex<Option<u32>>,
    released: Condvar,
}

impl AlertGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread currently holding the gate.
    pub fn owner(&self) -> Option<u32> {
        *lock(&self.owner)
    }

    /// Blocks until no other thread holds the gate.
    ///
    /// Returns `false` without blocking if `thread_id` itself holds the gate.
    pub fn wait_idle(&self, thread_id: u32) -> bool {
        let mut owner = lock(&self.owner);
        loop {
            match *owner {
                None => return true,
                Some(current) if current == thread_id => return false,
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Takes the gate for `thread_id`, blocking while another thread holds it.
    ///
    /// Returns `None` if `thread_id` already holds the gate. The gate is released when the
    /// returned guard is dropped.
    pub fn acquire(&self, thread_id: u32) -> Option<GateGuard<'_>> {
        let mut owner = lock(&self.owner);
        loop {
            match *owner {
                None => {
                    *owner = Some(thread_id);
                    return Some(GateGuard { gate: self });
                }
                Some(current) if current == thread_id => return None,
                Some(_) => {
                    owner = self
                        .released
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Releases an [`AlertGate`] and wakes every waiting thread when dropped.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a AlertGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.gate.owner) = None;
        self.gate.released.notify_all();
    }
}

/// Formats the text of the crash alert.
pub fn alert_message(paths: &ArtifactPaths) -> String {
    format!(
        "An error within the game has occurred and was caught by the crash handler.\n\n\
         This could be caused by a faulty plugin.\n\
         Please report this issue, more information has been recorded separately.\n\n\
         The crash dump file is located at:\n\
         {}\n\n\
         The log file is located at:\n\
         {}\n\n\
         Press OK to exit the application.",
        paths.dump.display(),
        paths.log.display(),
    )
}

/// The process-wide crash handler.
///
/// Generic over the OS backend so that the lifecycle can be driven by a fake platform in tests.
/// The Windows entry points keep a single instance in a static.
pub struct CrashHandler<P: Platform> {
    platform: P,
    config: Config,
    classifier: Classifier,
    installed: AtomicBool,
    registration: Mutex<Option<P::Registration>>,
    symbols_initialized: AtomicBool,
    gate: AlertGate,
}

impl<P: Platform> fmt::Debug for CrashHandler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrashHandler")
            .field("target_module", &self.classifier.target_module())
            .field("installed", &self.is_installed())
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl<P: Platform> CrashHandler<P> {
    pub fn new(platform: P, config: Config) -> Self {
        let classifier = Classifier::new(config.target_module.clone());
        Self {
            platform,
            config,
            classifier,
            installed: AtomicBool::new(false),
            registration: Mutex::new(None),
            symbols_initialized: AtomicBool::new(false),
            gate: AlertGate::new(),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Registers the interceptor, returning `false` if it is already registered or the OS
    /// refused.
    pub fn install(&self) -> bool {
        match self.try_install() {
            Ok(()) => true,
            Err(Error::AlreadyInstalled) => {
                tracing::debug!("crash handler is already installed");
                false
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to install crash handler"
                );
                false
            }
        }
    }

    /// Registers the interceptor and initializes the symbol engine.
    ///
    /// The symbol engine is initialized once per process, on the first successful install. If
    /// that fails, the handler is still installed and reports fall back to module-relative
    /// addresses.
    pub fn try_install(&self) -> Result<(), Error> {
        let mut registration = lock(&self.registration);
        if registration.is_some() {
            return Err(Error::AlreadyInstalled);
        }

        let handle = self.platform.register()?;

        if !self.symbols_initialized.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.platform.initialize_symbols() {
                self.symbols_initialized.store(false, Ordering::Release);
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "symbols will not be available in crash reports"
                );
            }
        }

        *registration = Some(handle);
        self.installed.store(true, Ordering::Release);
        tracing::info!(
            target_module = self.classifier.target_module(),
            "crash handler installed"
        );
        Ok(())
    }

    /// Unregisters the interceptor, returning `false` if nothing was registered or the OS
    /// refused.
    pub fn uninstall(&self) -> bool {
        match self.try_uninstall() {
            Ok(()) => true,
            Err(Error::NotInstalled) => {
                tracing::debug!("crash handler is not installed");
                false
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to uninstall crash handler"
                );
                false
            }
        }
    }

    pub fn try_uninstall(&self) -> Result<(), Error> {
        let mut registration = lock(&self.registration);
        let handle = registration.take().ok_or(Error::NotInstalled)?;

        if let Err(e) = self.platform.unregister(&handle) {
            // still registered with the OS
            *registration = Some(handle);
            return Err(e);
        }

        self.installed.store(false, Ordering::Release);
        tracing::info!("crash handler uninstalled");
        Ok(())
    }

    /// Handles a single fault on the faulting thread.
    ///
    /// Accepted faults produce a crash report, a minidump and an alert. Whatever happens, the
    /// fault is passed on to the next handler.
    pub fn handle_fault(&self, event: &FaultEvent<P::Context>) -> Disposition {
        let thread_id = event.thread_id;

        if !self.gate.wait_idle(thread_id) {
            tracing::debug!(
                thread_id,
                code = %event.code,
                "exception raised while handling a crash on the same thread"
            );
            return Disposition::ContinueSearch;
        }

        tracing::trace!(phase = %Phase::Classifying, code = %event.code);
        match self.classifier.classify(&self.platform, event) {
            Classification::Accepted => {}
            Classification::IgnoredCode => {
                tracing::trace!(code = %event.code, "ignoring non-fatal exception");
                return Disposition::ContinueSearch;
            }
            Classification::ForeignAddress => {
                tracing::debug!(
                    code = %event.code,
                    address = format_args!("{:#x}", event.address),
                    "ignoring exception outside of {}",
                    self.classifier.target_module(),
                );
                return Disposition::ContinueSearch;
            }
        }

        let Some(_gate) = self.gate.acquire(thread_id) else {
            return Disposition::ContinueSearch;
        };

        tracing::trace!(phase = %Phase::Reporting);
        tracing::warn!(
            code = %event.code,
            name = event.code.name(),
            address = format_args!("{:#x}", event.address),
            thread_id,
            "intercepted fatal exception"
        );

        let paths = self.write_artifacts(event);

        if self.config.alert.enabled {
            tracing::trace!(phase = %Phase::Displaying);
            self.platform
                .show_alert(&self.config.alert.title, &alert_message(&paths));
        }

        tracing::trace!(phase = %Phase::Idle);
        Disposition::ContinueSearch
    }

    /// Writes the crash report and the minidump, logging failures of either.
    fn write_artifacts(&self, event: &FaultEvent<P::Context>) -> ArtifactPaths {
        let timestamp = Local::now().fixed_offset();

        let image = self.platform.image_path().unwrap_or_else(|| {
            let e = Error::ImagePath;
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "writing crash artifacts to the working directory"
            );
            PathBuf::new()
        });
        let paths = ArtifactPaths::beside(&image, &self.config, timestamp, event.thread_id);

        self.platform.refresh_symbols();

        let report = Report::capture(
            &self.platform,
            &mut self.platform.unwinder(event),
            event,
            self.config.max_frames,
            timestamp,
        );
        match report.write_to_path(&paths.log) {
            Ok(()) => tracing::info!(path = %paths.log.display(), "wrote crash report"),
            Err(e) => tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %paths.log.display(),
                "failed to write crash report"
            ),
        }

        match write_dump(&self.platform, &paths.dump, event, self.config.dump_kind) {
            Ok(()) => tracing::info!(path = %paths.dump.display(), "wrote minidump"),
            Err(e) => tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %paths.dump.display(),
                "failed to write minidump"
            ),
        }

        paths
    }
}
