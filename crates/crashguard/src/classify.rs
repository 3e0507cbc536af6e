//! Decides whether an intercepted exception is worth reporting.
//!
//! The interceptor sees every exception raised in the process, including the ones the host or
//! its runtimes throw on purpose. Only a fixed set of irrecoverable exception codes raised
//! from within the target executable are reported; everything else passes through untouched.

use crate::platform::AddressSpace;
use crate::types::{ExceptionCode, FaultEvent};

/// Exception codes treated as fatal, with their symbolic names.
const FATAL_EXCEPTIONS: &[(u32, &str)] = &[
    (0xC000_0005, "STATUS_ACCESS_VIOLATION"),
    (0xC000_0006, "STATUS_IN_PAGE_ERROR"),
    (0xC000_0008, "STATUS_INVALID_HANDLE"),
    (0xC000_000D, "STATUS_INVALID_PARAMETER"),
    (0xC000_0017, "STATUS_NO_MEMORY"),
    (0xC000_001D, "STATUS_ILLEGAL_INSTRUCTION"),
    (0xC000_0025, "STATUS_NONCONTINUABLE_EXCEPTION"),
    (0xC000_0026, "STATUS_INVALID_DISPOSITION"),
    (0xC000_008C, "STATUS_ARRAY_BOUNDS_EXCEEDED"),
    (0xC000_008D, "STATUS_FLOAT_DENORMAL_OPERAND"),
    (0xC000_008E, "STATUS_FLOAT_DIVIDE_BY_ZERO"),
    (0xC000_008F, "STATUS_FLOAT_INEXACT_RESULT"),
    (0xC000_0090, "STATUS_FLOAT_INVALID_OPERATION"),
    (0xC000_0091, "STATUS_FLOAT_OVERFLOW"),
    (0xC000_0092, "STATUS_FLOAT_STACK_CHECK"),
    (0xC000_0093, "STATUS_FLOAT_UNDERFLOW"),
    (0xC000_0094, "STATUS_INTEGER_DIVIDE_BY_ZERO"),
    (0xC000_0095, "STATUS_INTEGER_OVERFLOW"),
    (0xC000_0096, "STATUS_PRIVILEGED_INSTRUCTION"),
    (0xC000_00FD, "STATUS_STACK_OVERFLOW"),
    (0xC000_0135, "STATUS_DLL_NOT_FOUND"),
    (0xC000_0138, "STATUS_ORDINAL_NOT_FOUND"),
    (0xC000_0139, "STATUS_ENTRYPOINT_NOT_FOUND"),
    (0xC000_0142, "STATUS_DLL_INIT_FAILED"),
    (0xC000_01B2, "STATUS_CONTROL_STACK_VIOLATION"),
    (0xC000_02B4, "STATUS_FLOAT_MULTIPLE_FAULTS"),
    (0xC000_02B5, "STATUS_FLOAT_MULTIPLE_TRAPS"),
    (0xC000_0374, "STATUS_HEAP_CORRUPTION"),
    (0xC000_0409, "STATUS_STACK_BUFFER_OVERRUN"),
    (0xC000_0417, "STATUS_INVALID_CRUNTIME_PARAMETER"),
    (0xC000_0516, "STATUS_THREAD_NOT_RUNNING"),
    (0xC000_0718, "STATUS_ALREADY_REGISTERED"),
];

/// Returns `true` if `code` is one of the fatal exception codes we report on.
pub fn is_whitelisted(code: ExceptionCode) -> bool {
    exception_name(code).is_some()
}

/// The symbolic name of a fatal exception code.
pub fn exception_name(code: ExceptionCode) -> Option<&'static str> {
    FATAL_EXCEPTIONS
        .iter()
        .find(|(raw, _)| *raw == code.0)
        .map(|(_, name)| *name)
}

/// Returns `true` if `addr` lies within the image whose file name is `target_module`.
///
/// File names are compared case-insensitively. Unmapped addresses and addresses in any other
/// image, including our own, are never target addresses.
pub fn is_target_address<S>(space: &S, addr: u64, target_module: &str) -> bool
where
    S: AddressSpace + ?Sized,
{
    match space.module_at(addr) {
        Some(module) => module.file_name().eq_ignore_ascii_case(target_module),
        None => false,
    }
}

/// The outcome of classifying a fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    /// The fault should be reported.
    Accepted,
    /// The exception code is not a fatal one.
    IgnoredCode,
    /// The faulting instruction is outside the target executable.
    ForeignAddress,
}

/// Applies both checks for a configured target executable.
#[derive(Clone, Debug)]
pub struct Classifier {
    target_module: String,
}

impl Classifier {
    pub fn new(target_module: impl Into<String>) -> Self {
        Self {
            target_module: target_module.into(),
        }
    }

    pub fn target_module(&self) -> &str {
        &self.target_module
    }

    /// Classifies `event`. The cheap code check runs first so that routine exceptions never
    /// hit the module loader.
    pub fn classify<S, C>(&self, space: &S, event: &FaultEvent<C>) -> Classification
    where
        S: AddressSpace + ?Sized,
    {
        if !is_whitelisted(event.code) {
            return Classification::IgnoredCode;
        }

        if !is_target_address(space, event.address, &self.target_module) {
            return Classification::ForeignAddress;
        }

        Classification::Accepted
    }
}
