//! The Windows x86-64 backend.
//!
//! Faults are intercepted with a vectored exception handler, symbols and unwind information
//! come from DbgHelp, and the process snapshot is a minidump written by `MiniDumpWriteDump`.
//!
//! DbgHelp is not thread safe, so every call into it goes through [`dbghelp`].

use std::ffi::{OsString, c_void};
use std::fs::File;
use std::io;
use std::iter;
use std::marker::PhantomData;
use std::mem;
use std::os::windows::ffi::OsStringExt;
use std::os::windows::io::AsRawHandle;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::Diagnostics::Debug::{
    ADDRESS64, AddVectoredExceptionHandler, AddrModeFlat, CONTEXT, EXCEPTION_POINTERS,
    MINIDUMP_EXCEPTION_INFORMATION, MINIDUMP_TYPE, MiniDumpNormal, MiniDumpWithDataSegs,
    MiniDumpWithFullMemory, MiniDumpWriteDump, ReadProcessMemory, RemoveVectoredExceptionHandler,
    STACKFRAME64, SYMBOL_INFOW, StackWalk64, SymFromAddrW, SymFunctionTableAccess64,
    SymGetModuleBase64, SymInitializeW, SymRefreshModuleList,
};
use windows_sys::Win32::System::LibraryLoader::{
    GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    GetModuleFileNameW, GetModuleHandleExW,
};
use windows_sys::Win32::System::SystemInformation::IMAGE_FILE_MACHINE_AMD64;
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, GetCurrentThread, GetCurrentThreadId,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    MB_ICONERROR, MB_OK, MB_TOPMOST, MessageBoxW,
};

use crate::config::Config;
use crate::error::Error;
use crate::handler::{CrashHandler, Disposition};
use crate::logging::{ensure_log_error, init_logging};
use crate::platform::{AddressSpace, DumpKind, Platform, Unwind, UnwoundFrame};
use crate::types::{
    AccessKind, AccessViolation, ExceptionCode, FaultEvent, ModuleInfo, Registers, SymbolInfo,
};

/// Longest symbol name DbgHelp is asked to return, in UTF-16 units.
const MAX_SYM_NAME: usize = 2000;

/// Longest module path we are willing to read, in UTF-16 units.
const MAX_MODULE_PATH: usize = 32 * 1024;

static HANDLER: OnceLock<CrashHandler<WindowsPlatform>> = OnceLock::new();

static DBGHELP: Mutex<()> = Mutex::new(());

fn dbghelp() -> MutexGuard<'static, ()> {
    DBGHELP.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs the process-wide crash handler.
///
/// On first use, this loads `crashguard.yml` from next to the crash handler image and sets up
/// logging. Returns `false` if the handler was already installed or could not be registered.
pub fn install() -> bool {
    HANDLER.get_or_init(new_handler).install()
}

/// Removes the process-wide crash handler. Returns `false` if it was not installed.
pub fn uninstall() -> bool {
    HANDLER.get().is_some_and(|handler| handler.uninstall())
}

/// C entry point for loaders that inject the crash handler as a plain DLL.
#[unsafe(no_mangle)]
pub extern "C" fn crashguard_install() -> bool {
    install()
}

/// C counterpart of [`crashguard_install`].
#[unsafe(no_mangle)]
pub extern "C" fn crashguard_uninstall() -> bool {
    uninstall()
}

fn new_handler() -> CrashHandler<WindowsPlatform> {
    let platform = WindowsPlatform;

    let (config, config_error) = match platform.image_path() {
        Some(image) => match Config::beside_image(&image) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
        None => (Config::default(), None),
    };

    init_logging(&config.logging);
    if let Some(e) = config_error {
        ensure_log_error(&e.context("ignoring crash handler configuration"));
    }

    CrashHandler::new(platform, config)
}

/// The vectored exception handler registered with the OS.
unsafe extern "system" fn vectored_handler(pointers: *mut EXCEPTION_POINTERS) -> i32 {
    let continue_search = Disposition::ContinueSearch.as_raw();

    let Some(handler) = HANDLER.get() else {
        return continue_search;
    };

    // SAFETY: the OS hands us valid exception pointers for the duration of this call.
    let Some(event) = (unsafe { fault_event(pointers) }) else {
        return continue_search;
    };

    panic::catch_unwind(AssertUnwindSafe(|| handler.handle_fault(&event)))
        .map(Disposition::as_raw)
        .unwrap_or(continue_search)
}

/// Exception state as the OS delivered it.
#[derive(Clone, Copy)]
pub struct NativeContext {
    /// Handed to the minidump writer. Only valid while the handler runs.
    pointers: *mut EXCEPTION_POINTERS,
    /// Copy of the faulting thread's context, seeds the unwinder.
    context: CONTEXT,
}

/// Builds a [`FaultEvent`] from the arguments of a vectored exception handler.
///
/// # Safety
///
/// `pointers` must be null or point to valid exception pointers.
unsafe fn fault_event(pointers: *mut EXCEPTION_POINTERS) -> Option<FaultEvent<NativeContext>> {
    // SAFETY: guaranteed by the caller.
    let (record, context) = unsafe {
        let ex = pointers.as_ref()?;
        (ex.ExceptionRecord.as_ref()?, ex.ContextRecord.as_ref()?)
    };

    let code = ExceptionCode(record.ExceptionCode as u32);
    let access = if code == ExceptionCode::ACCESS_VIOLATION && record.NumberParameters >= 2 {
        AccessKind::from_raw(record.ExceptionInformation[0] as u64).map(|kind| AccessViolation {
            kind,
            address: record.ExceptionInformation[1] as u64,
        })
    } else {
        None
    };

    Some(FaultEvent {
        code,
        address: context.Rip,
        registers: registers(context),
        // SAFETY: plain syscall.
        thread_id: unsafe { GetCurrentThreadId() },
        access,
        native: NativeContext {
            pointers,
            context: *context,
        },
    })
}

fn registers(context: &CONTEXT) -> Registers {
    Registers {
        rax: context.Rax,
        rbx: context.Rbx,
        rcx: context.Rcx,
        rdx: context.Rdx,
        rsi: context.Rsi,
        rdi: context.Rdi,
        rbp: context.Rbp,
        rsp: context.Rsp,
        r8: context.R8,
        r9: context.R9,
        r10: context.R10,
        r11: context.R11,
        r12: context.R12,
        r13: context.R13,
        r14: context.R14,
        r15: context.R15,
        rip: context.Rip,
    }
}

/// Handle of a registered vectored exception handler.
#[derive(Debug)]
pub struct VehHandle(NonNull<c_void>);

// SAFETY: the handle is an opaque token, any thread may unregister it.
unsafe impl Send for VehHandle {}

/// Native facilities of the current Windows process.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowsPlatform;

fn module_file_name(module: HMODULE) -> Option<PathBuf> {
    let mut buf = vec![0u16; 260];
    loop {
        // SAFETY: `buf` is valid for `buf.len()` UTF-16 units.
        let len = unsafe { GetModuleFileNameW(module, buf.as_mut_ptr(), buf.len() as u32) };
        let len = len as usize;
        if len == 0 {
            return None;
        }
        if len < buf.len() {
            return Some(OsString::from_wide(&buf[..len]).into());
        }
        // truncated
        if buf.len() >= MAX_MODULE_PATH {
            return None;
        }
        buf.resize(buf.len() * 2, 0);
    }
}

impl AddressSpace for WindowsPlatform {
    fn module_at(&self, addr: u64) -> Option<ModuleInfo> {
        let mut module: HMODULE = ptr::null_mut();
        // SAFETY: with FROM_ADDRESS, the name argument is an address and never dereferenced as
        // a string. UNCHANGED_REFCOUNT means there is nothing to release.
        let ok = unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                addr as usize as *const u16,
                &mut module,
            )
        };
        if ok == 0 || module.is_null() {
            return None;
        }

        let path = module_file_name(module)?;
        Some(ModuleInfo::new(module as u64, path))
    }

    fn symbol_at(&self, addr: u64) -> Option<SymbolInfo> {
        // u64 elements keep the buffer aligned for SYMBOL_INFOW
        let size = mem::size_of::<SYMBOL_INFOW>() + MAX_SYM_NAME * mem::size_of::<u16>();
        let mut buffer = vec![0u64; size.div_ceil(mem::size_of::<u64>())];
        let symbol = buffer.as_mut_ptr().cast::<SYMBOL_INFOW>();
        let mut displacement = 0;

        let _dbghelp = dbghelp();
        // SAFETY: `symbol` points to a zeroed buffer large enough for the header plus
        // `MAX_SYM_NAME` name characters, and DbgHelp access is serialized.
        unsafe {
            (*symbol).SizeOfStruct = mem::size_of::<SYMBOL_INFOW>() as u32;
            (*symbol).MaxNameLen = MAX_SYM_NAME as u32;

            if SymFromAddrW(GetCurrentProcess(), addr, &mut displacement, symbol) == 0 {
                return None;
            }

            let len = ((*symbol).NameLen as usize).min(MAX_SYM_NAME);
            let name = slice::from_raw_parts(ptr::addr_of!((*symbol).Name).cast::<u16>(), len);
            Some(SymbolInfo {
                name: String::from_utf16_lossy(name),
                displacement,
            })
        }
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut value = 0u64;
        let mut read = 0usize;
        // SAFETY: ReadProcessMemory validates the source range and fails instead of faulting.
        let ok = unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                addr as usize as *const c_void,
                ptr::addr_of_mut!(value).cast(),
                mem::size_of::<u64>(),
                &mut read,
            )
        };
        (ok != 0 && read == mem::size_of::<u64>()).then_some(value)
    }
}

/// Unwinds with `StackWalk64`, starting from a copy of the faulting context.
pub struct WindowsUnwinder<'a> {
    frame: STACKFRAME64,
    context: CONTEXT,
    _platform: PhantomData<&'a WindowsPlatform>,
}

fn flat(offset: u64) -> ADDRESS64 {
    ADDRESS64 {
        Offset: offset,
        Segment: 0,
        Mode: AddrModeFlat,
    }
}

impl Unwind for WindowsUnwinder<'_> {
    fn step(&mut self) -> Option<UnwoundFrame> {
        let _dbghelp = dbghelp();
        // SAFETY: both the frame and the context are owned by the unwinder, and DbgHelp access
        // is serialized.
        let ok = unsafe {
            StackWalk64(
                IMAGE_FILE_MACHINE_AMD64 as u32,
                GetCurrentProcess(),
                GetCurrentThread(),
                &mut self.frame,
                ptr::addr_of_mut!(self.context).cast(),
                None,
                Some(SymFunctionTableAccess64),
                Some(SymGetModuleBase64),
                None,
            )
        };

        (ok != 0).then(|| UnwoundFrame {
            instruction_addr: self.frame.AddrPC.Offset,
            return_addr: self.frame.AddrReturn.Offset,
        })
    }
}

fn minidump_type(kind: DumpKind) -> MINIDUMP_TYPE {
    match kind {
        DumpKind::Normal => MiniDumpNormal,
        DumpKind::DataSegments => MiniDumpWithDataSegs,
        DumpKind::FullMemory => MiniDumpWithFullMemory,
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(iter::once(0)).collect()
}

impl Platform for WindowsPlatform {
    type Context = NativeContext;
    type Registration = VehHandle;
    type Unwinder<'a> = WindowsUnwinder<'a>;

    fn register(&self) -> Result<VehHandle, Error> {
        // SAFETY: `vectored_handler` lives as long as the process.
        let handle = unsafe { AddVectoredExceptionHandler(0, Some(vectored_handler)) };
        NonNull::new(handle)
            .map(VehHandle)
            .ok_or_else(|| Error::Registration(io::Error::last_os_error()))
    }

    fn unregister(&self, registration: &VehHandle) -> Result<(), Error> {
        // SAFETY: the handle was returned by AddVectoredExceptionHandler.
        if unsafe { RemoveVectoredExceptionHandler(registration.0.as_ptr()) } == 0 {
            return Err(Error::Unregistration(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn initialize_symbols(&self) -> Result<(), Error> {
        let _dbghelp = dbghelp();
        // SAFETY: default search path, enumerate the modules that are already loaded.
        if unsafe { SymInitializeW(GetCurrentProcess(), ptr::null(), 1) } == 0 {
            return Err(Error::Symbols(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn refresh_symbols(&self) {
        let _dbghelp = dbghelp();
        // SAFETY: plain DbgHelp call, serialized.
        if unsafe { SymRefreshModuleList(GetCurrentProcess()) } == 0 {
            tracing::debug!(
                error = &io::Error::last_os_error() as &dyn std::error::Error,
                "failed to refresh symbol module list"
            );
        }
    }

    fn unwinder<'a>(&'a self, event: &FaultEvent<NativeContext>) -> WindowsUnwinder<'a> {
        // SAFETY: STACKFRAME64 is plain data, all zeroes is its documented initial state.
        let mut frame: STACKFRAME64 = unsafe { mem::zeroed() };
        frame.AddrPC = flat(event.registers.instruction_pointer());
        frame.AddrStack = flat(event.registers.stack_pointer());
        frame.AddrFrame = flat(event.registers.frame_pointer());

        WindowsUnwinder {
            frame,
            context: event.native.context,
            _platform: PhantomData,
        }
    }

    fn image_path(&self) -> Option<PathBuf> {
        self.module_at(vectored_handler as usize as u64)
            .map(|module| module.path)
    }

    fn write_snapshot(
        &self,
        file: &File,
        event: &FaultEvent<NativeContext>,
        kind: DumpKind,
    ) -> Result<(), Error> {
        let exception = MINIDUMP_EXCEPTION_INFORMATION {
            ThreadId: event.thread_id,
            ExceptionPointers: event.native.pointers,
            ClientPointers: 0,
        };

        let _dbghelp = dbghelp();
        // SAFETY: the exception pointers belong to this process and outlive the call.
        let ok = unsafe {
            MiniDumpWriteDump(
                GetCurrentProcess(),
                GetCurrentProcessId(),
                file.as_raw_handle(),
                minidump_type(kind),
                &exception,
                ptr::null(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(Error::Dump(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn show_alert(&self, title: &str, message: &str) {
        let title = wide(title);
        let message = wide(message);
        // SAFETY: both strings are NUL terminated and outlive the call.
        unsafe {
            MessageBoxW(
                ptr::null_mut(),
                message.as_ptr(),
                title.as_ptr(),
                MB_OK | MB_ICONERROR | MB_TOPMOST,
            );
        }
    }
}
