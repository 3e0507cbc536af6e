//! The native capabilities the crash handler needs from the operating system.
//!
//! Everything OS specific (registering with the fault dispatch chain, unwinding, symbol lookup,
//! writing a process snapshot and showing an alert) sits behind [`Platform`], so that the
//! classification, rendering and lifecycle logic can be shared between backends and exercised
//! with an in-memory fake in tests.

use std::fs::File;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;
use crate::types::{FaultEvent, ModuleInfo, SymbolInfo};

#[cfg(all(windows, target_arch = "x86_64"))]
pub mod windows;

/// Read-only queries against the address space of the current process.
///
/// None of these may fail loudly: a missing answer is expressed as `None` and callers degrade
/// to a coarser rendering.
pub trait AddressSpace {
    /// Looks up the loaded image containing `addr`.
    fn module_at(&self, addr: u64) -> Option<ModuleInfo>;

    /// Looks up the debug symbol covering `addr`.
    fn symbol_at(&self, addr: u64) -> Option<SymbolInfo>;

    /// Reads a single 8-byte value at `addr`, returning `None` if the memory is not readable.
    fn read_u64(&self, addr: u64) -> Option<u64>;
}

/// A frame produced by one step of an [`Unwind`] cursor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UnwoundFrame {
    /// The instruction address of the frame that was stepped to.
    pub instruction_addr: u64,
    /// The return address of that frame, `0` if there is no caller.
    pub return_addr: u64,
}

/// A frame cursor seeded from the faulting thread's registers.
pub trait Unwind {
    /// Steps to the caller frame, returning `None` when the unwinder cannot go any further.
    fn step(&mut self) -> Option<UnwoundFrame>;
}

/// The flavor of process snapshot to write.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpKind {
    /// Thread stacks and module list only.
    Normal,
    /// Additionally includes the data sections of all loaded images.
    #[default]
    DataSegments,
    /// All accessible memory of the process.
    FullMemory,
}

/// The complete set of native facilities of a backend.
pub trait Platform: AddressSpace + Send + Sync {
    /// The native fault context carried in [`FaultEvent::native`].
    type Context;

    /// Handle returned by [`register`](Self::register), needed to unregister again.
    type Registration: Send;

    /// The unwinder returned by [`unwinder`](Self::unwinder).
    type Unwinder<'a>: Unwind
    where
        Self: 'a;

    /// Adds the interceptor to the OS fault dispatch chain.
    fn register(&self) -> Result<Self::Registration, Error>;

    /// Removes a previously registered interceptor.
    fn unregister(&self, registration: &Self::Registration) -> Result<(), Error>;

    /// Initializes the process-wide symbol engine. Called at most once per process.
    fn initialize_symbols(&self) -> Result<(), Error>;

    /// Reloads the symbol engine's module list so that late-loaded modules resolve.
    fn refresh_symbols(&self);

    /// Creates a frame cursor for the thread that raised `event`.
    fn unwinder<'a>(&'a self, event: &FaultEvent<Self::Context>) -> Self::Unwinder<'a>;

    /// The file path of the image this component was loaded from.
    fn image_path(&self) -> Option<PathBuf>;

    /// Serializes a snapshot of the current process for `event` into `file`.
    fn write_snapshot(
        &self,
        file: &File,
        event: &FaultEvent<Self::Context>,
        kind: DumpKind,
    ) -> Result<(), Error>;

    /// Shows a blocking, modal alert to the user.
    fn show_alert(&self, title: &str, message: &str);
}
