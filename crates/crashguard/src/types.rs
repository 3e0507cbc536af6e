use std::fmt;
use std::path::PathBuf;

/// A raw OS exception code, such as `0xC0000005` for an access violation.
///
/// Displays as upper-case hexadecimal without a prefix, which is how the report prints it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExceptionCode(pub u32);

impl ExceptionCode {
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    pub const BREAKPOINT: Self = Self(0x8000_0003);
    pub const SINGLE_STEP: Self = Self(0x8000_0004);

    /// The symbolic name of this code, if it is one of the fatal codes we report on.
    pub fn name(self) -> Option<&'static str> {
        crate::classify::exception_name(self)
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}", self.0)
    }
}

impl From<u32> for ExceptionCode {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

/// The x86-64 integer register file captured at the time of the fault.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Registers {
    /// The sixteen general purpose registers, in the order they appear in the report.
    pub fn general_purpose(&self) -> [(&'static str, u64); 16] {
        [
            ("RAX", self.rax),
            ("RBX", self.rbx),
            ("RCX", self.rcx),
            ("RDX", self.rdx),
            ("R8", self.r8),
            ("R9", self.r9),
            ("R10", self.r10),
            ("R11", self.r11),
            ("R12", self.r12),
            ("R13", self.r13),
            ("R14", self.r14),
            ("R15", self.r15),
            ("RSI", self.rsi),
            ("RDI", self.rdi),
            ("RBP", self.rbp),
            ("RSP", self.rsp),
        ]
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    pub fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    pub fn frame_pointer(&self) -> u64 {
        self.rbp
    }
}

/// The kind of memory access that caused an access violation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// Maps the first access violation exception parameter to an access kind.
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            8 => Some(Self::Execute),
            _ => None,
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AccessKind::Read => write!(f, "read"),
            AccessKind::Write => write!(f, "write"),
            AccessKind::Execute => write!(f, "execute"),
        }
    }
}

/// Details carried by access violations: what was attempted, and where.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AccessViolation {
    pub kind: AccessKind,
    pub address: u64,
}

/// A single intercepted exception.
///
/// `C` is the backend's native fault context. It is never inspected by the portable code and
/// only handed back to the backend when writing the process snapshot.
#[derive(Clone, Debug)]
pub struct FaultEvent<C = ()> {
    /// The OS exception code.
    pub code: ExceptionCode,
    /// The address of the faulting instruction.
    pub address: u64,
    /// Register state of the faulting thread.
    pub registers: Registers,
    /// The thread on which the fault occurred.
    pub thread_id: u32,
    /// Present for access violations that report the inaccessible address.
    pub access: Option<AccessViolation>,
    /// Native context, passed through unmodified to the dump writer.
    pub native: C,
}

/// A loaded executable or library image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleInfo {
    /// The address the image is mapped at.
    pub base: u64,
    /// The file backing the image.
    pub path: PathBuf,
}

impl ModuleInfo {
    pub fn new(base: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            base,
            path: path.into(),
        }
    }

    /// The file name of the image.
    ///
    /// Both `\` and `/` separate path components, since loaders report Windows paths
    /// regardless of the platform this runs on.
    pub fn file_name(&self) -> String {
        let path = self.path.to_string_lossy();
        match path.rsplit(['\\', '/']).next() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => path.into_owned(),
        }
    }
}

/// A debug symbol covering an address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolInfo {
    pub name: String,
    /// Distance in bytes from the start of the symbol.
    pub displacement: u64,
}

/// One unwound frame in a call stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameRecord {
    pub index: usize,
    pub instruction_addr: u64,
    /// The instruction address rendered by the resolver.
    pub location: String,
}
