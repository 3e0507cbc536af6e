use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use crashguard::platform::{AddressSpace, DumpKind, Platform, Unwind, UnwoundFrame};
use crashguard::types::{ExceptionCode, FaultEvent, ModuleInfo, Registers, SymbolInfo};
use crashguard::{Config, CrashHandler, Disposition, Error};

/// Base address of the fake target executable.
pub const TARGET_BASE: u64 = 0x1_4000_0000;
/// Base address of the fake crash handler image.
pub const HANDLER_BASE: u64 = 0x7FF8_0000_0000;
/// Stack pointer used by [`fault`].
pub const STACK: u64 = 0x50_0000;

/// A recorded call to [`Platform::show_alert`].
#[derive(Clone, Debug)]
pub struct Alert {
    pub title: String,
    pub message: String,
}

/// A recorded call to [`Platform::write_snapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub thread_id: u32,
    pub kind: DumpKind,
}

#[derive(Debug, Default)]
pub struct MockState {
    next_registration: u64,
    pub registrations: Vec<u64>,
    pub symbol_inits: usize,
    pub refreshes: usize,
    pub snapshots: Vec<Snapshot>,
    pub alerts: Vec<Alert>,
}

/// Lets a test hold alerts open until it dismisses them.
pub struct AlertControl {
    /// Receives one message each time an alert opens.
    pub opened: Receiver<()>,
    /// Dismisses one open alert per message.
    pub dismiss: Sender<()>,
}

struct AlertHooks {
    opened: Sender<()>,
    dismiss: Mutex<Receiver<()>>,
}

/// An in-memory process with a target executable, the crash handler image and a stack.
pub struct MockPlatform {
    image: Option<PathBuf>,
    memory: BTreeMap<u64, u64>,
    symbols: BTreeMap<u64, SymbolInfo>,
    frames: Vec<UnwoundFrame>,
    fail_register: bool,
    fail_unregister: bool,
    fail_symbols: bool,
    fail_snapshot: bool,
    alert_hooks: Option<AlertHooks>,
    state: Mutex<MockState>,
}

impl MockPlatform {
    /// Creates a process whose crash handler image lives in `image_dir`.
    pub fn new(image_dir: &Path) -> Self {
        let mut memory = BTreeMap::new();
        for slot in 0..16 {
            memory.insert(STACK + slot * 8, 0);
        }
        memory.insert(STACK, TARGET_BASE + 0x2010);

        let mut symbols = BTreeMap::new();
        symbols.insert(
            TARGET_BASE + 0x2010,
            SymbolInfo {
                name: "Framework::Tick".to_owned(),
                displacement: 0x10,
            },
        );

        Self {
            image: Some(image_dir.join("crashguard.dll")),
            memory,
            symbols,
            frames: vec![
                UnwoundFrame {
                    instruction_addr: TARGET_BASE + 0x2010,
                    return_addr: TARGET_BASE + 0x3000,
                },
                UnwoundFrame {
                    instruction_addr: TARGET_BASE + 0x3000,
                    return_addr: 0,
                },
            ],
            fail_register: false,
            fail_unregister: false,
            fail_symbols: false,
            fail_snapshot: false,
            alert_hooks: None,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn without_image(mut self) -> Self {
        self.image = None;
        self
    }

    pub fn failing_register(mut self) -> Self {
        self.fail_register = true;
        self
    }

    pub fn failing_unregister(mut self) -> Self {
        self.fail_unregister = true;
        self
    }

    pub fn failing_symbols(mut self) -> Self {
        self.fail_symbols = true;
        self
    }

    pub fn failing_snapshot(mut self) -> Self {
        self.fail_snapshot = true;
        self
    }

    /// Makes every alert block until the test dismisses it.
    pub fn with_alert_control(mut self) -> (Self, AlertControl) {
        let (opened_tx, opened_rx) = mpsc::channel();
        let (dismiss_tx, dismiss_rx) = mpsc::channel();
        self.alert_hooks = Some(AlertHooks {
            opened: opened_tx,
            dismiss: Mutex::new(dismiss_rx),
        });
        let control = AlertControl {
            opened: opened_rx,
            dismiss: dismiss_tx,
        };
        (self, control)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl AddressSpace for MockPlatform {
    fn module_at(&self, addr: u64) -> Option<ModuleInfo> {
        match addr {
            TARGET_BASE..0x1_4100_0000 => Some(ModuleInfo::new(
                TARGET_BASE,
                r"C:\Program Files\Game\ffxiv_dx11.exe",
            )),
            HANDLER_BASE..0x7FF8_0010_0000 => Some(ModuleInfo::new(
                HANDLER_BASE,
                r"C:\Program Files\Game\crashguard.dll",
            )),
            _ => None,
        }
    }

    fn symbol_at(&self, addr: u64) -> Option<SymbolInfo> {
        self.symbols.get(&addr).cloned()
    }

    fn read_u64(&self, addr: u64) -> Option<u64> {
        self.memory.get(&addr).copied()
    }
}

pub struct MockUnwinder<'a> {
    frames: std::slice::Iter<'a, UnwoundFrame>,
}

impl Unwind for MockUnwinder<'_> {
    fn step(&mut self) -> Option<UnwoundFrame> {
        self.frames.next().copied()
    }
}

impl Platform for MockPlatform {
    type Context = ();
    type Registration = u64;
    type Unwinder<'a> = MockUnwinder<'a>;

    fn register(&self) -> Result<u64, Error> {
        if self.fail_register {
            return Err(Error::Registration(io::Error::other("registration refused")));
        }
        let mut state = self.state();
        state.next_registration += 1;
        let registration = state.next_registration;
        state.registrations.push(registration);
        Ok(registration)
    }

    fn unregister(&self, registration: &u64) -> Result<(), Error> {
        if self.fail_unregister {
            return Err(Error::Unregistration(io::Error::other("unknown handle")));
        }
        self.state().registrations.retain(|r| r != registration);
        Ok(())
    }

    fn initialize_symbols(&self) -> Result<(), Error> {
        self.state().symbol_inits += 1;
        if self.fail_symbols {
            return Err(Error::Symbols(io::Error::other("no symbol engine")));
        }
        Ok(())
    }

    fn refresh_symbols(&self) {
        self.state().refreshes += 1;
    }

    fn unwinder<'a>(&'a self, _event: &FaultEvent) -> MockUnwinder<'a> {
        MockUnwinder {
            frames: self.frames.iter(),
        }
    }

    fn image_path(&self) -> Option<PathBuf> {
        self.image.clone()
    }

    fn write_snapshot(&self, file: &File, event: &FaultEvent, kind: DumpKind) -> Result<(), Error> {
        if self.fail_snapshot {
            return Err(Error::Dump(io::Error::other("snapshot failed")));
        }
        let mut file = file;
        file.write_all(b"MDMP").map_err(Error::Dump)?;
        file.write_all(&event.thread_id.to_le_bytes())
            .map_err(Error::Dump)?;
        self.state().snapshots.push(Snapshot {
            thread_id: event.thread_id,
            kind,
        });
        Ok(())
    }

    fn show_alert(&self, title: &str, message: &str) {
        self.state().alerts.push(Alert {
            title: title.to_owned(),
            message: message.to_owned(),
        });

        if let Some(ref hooks) = self.alert_hooks {
            hooks.opened.send(()).unwrap();
            hooks.dismiss.lock().unwrap().recv().unwrap();
        }
    }
}

/// A fault at `address` on `thread_id` with a plausible register file.
pub fn fault(code: ExceptionCode, address: u64, thread_id: u32) -> FaultEvent {
    FaultEvent {
        code,
        address,
        registers: Registers {
            rax: STACK,
            rcx: TARGET_BASE + 0x2010,
            rsp: STACK,
            rbp: STACK + 0x40,
            rip: address,
            ..Default::default()
        },
        thread_id,
        access: None,
        native: (),
    }
}

/// Delivers `event` the way the OS would: only while an interceptor is registered.
pub fn raise(handler: &CrashHandler<MockPlatform>, event: &FaultEvent) -> Option<Disposition> {
    if handler.platform().state().registrations.is_empty() {
        return None;
    }
    Some(handler.handle_fault(event))
}

/// Creates a handler for a mock process whose image lives in `image_dir`.
pub fn handler(image_dir: &Path) -> CrashHandler<MockPlatform> {
    handler_with(MockPlatform::new(image_dir), |_| ())
}

pub fn handler_with(
    platform: MockPlatform,
    update_config: impl FnOnce(&mut Config),
) -> CrashHandler<MockPlatform> {
    crashguard_test::setup();

    let mut config = Config {
        dump_file: "crashguard_appcrash.dmp".to_owned(),
        ..Config::default()
    };
    update_config(&mut config);

    CrashHandler::new(platform, config)
}
