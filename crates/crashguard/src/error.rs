use std::io;

use thiserror::Error;

/// Errors raised while installing the interceptor or writing crash artifacts.
///
/// None of these ever escape the fault path: the handler logs them and still lets the
/// fault continue to the next handler.
#[derive(Debug, Error)]
pub enum Error {
    /// The interceptor is already registered with the OS.
    #[error("crash handler is already installed")]
    AlreadyInstalled,
    /// There is no registered interceptor to remove.
    #[error("crash handler is not installed")]
    NotInstalled,
    /// The OS refused to add the interceptor to its fault dispatch chain.
    #[error("failed to register exception handler")]
    Registration(#[source] io::Error),
    /// The OS refused to remove the interceptor.
    #[error("failed to unregister exception handler")]
    Unregistration(#[source] io::Error),
    /// The symbol engine could not be initialized.
    #[error("failed to initialize the symbol engine")]
    Symbols(#[source] io::Error),
    /// The path of the image containing this component is unknown.
    #[error("could not determine the location of the crash handler image")]
    ImagePath,
    /// Writing the textual report failed.
    #[error("failed to write crash report")]
    Report(#[source] io::Error),
    /// Writing the process snapshot failed.
    #[error("failed to write minidump")]
    Dump(#[source] io::Error),
}
