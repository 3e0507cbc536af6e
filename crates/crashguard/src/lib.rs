//! Native crash interception for components injected into a host process.
//!
//! The crate installs a process-wide exception interceptor. Faults that originate in the
//! configured target executable and carry one of a fixed set of fatal exception codes are
//! written out as a textual diagnostic report (call stack, registers, stack memory) and a
//! minidump, after which the user is alerted. The interceptor never handles a fault itself: it
//! always lets the operating system continue searching for a handler, so the host's own crash
//! behavior is unchanged.
//!
//! The moving parts are:
//!
//!  - [`classify`]: decides whether a fault is interesting.
//!  - [`resolve`]: renders addresses as `module+offset`, symbols and pointees.
//!  - [`stackwalk`]: unwinds the faulting thread.
//!  - [`report`] and [`dump`]: write the two artifacts.
//!  - [`handler`]: the [`CrashHandler`] singleton tying everything together.
//!  - [`platform`]: the capability traits every OS backend implements.

pub mod classify;
pub mod config;
pub mod dump;
pub mod error;
pub mod handler;
pub mod logging;
pub mod platform;
pub mod report;
pub mod resolve;
pub mod stackwalk;
pub mod types;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::handler::{CrashHandler, Disposition};

#[cfg(all(windows, target_arch = "x86_64"))]
pub use crate::platform::windows::{install, uninstall};
