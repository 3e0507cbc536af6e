//! The human readable crash report.
//!
//! A report is captured once per accepted fault, written to a text file next to the crash
//! handler image, and dropped. Every address in it goes through the [`AddressResolver`].

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, FixedOffset};

use crate::error::Error;
use crate::platform::{AddressSpace, Unwind};
use crate::resolve::{AddressResolver, DEREF_ONCE, NO_DEREF, is_user_mode};
use crate::stackwalk::walk_stack;
use crate::types::{AccessViolation, ExceptionCode, FaultEvent, FrameRecord};

/// Number of 8-byte slots dumped from the top of the stack.
pub const STACK_SLOTS: u64 = 16;

/// One quad word read from the faulting thread's stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StackSlot {
    /// Offset from the stack pointer in bytes.
    pub offset: u64,
    /// The resolved value, `None` if the slot could not be read.
    pub value: Option<String>,
}

/// Everything we know about a fault, rendered.
#[derive(Clone, Debug)]
pub struct Report {
    pub timestamp: DateTime<FixedOffset>,
    pub code: ExceptionCode,
    /// The faulting instruction, resolved.
    pub location: String,
    pub access: Option<AccessViolation>,
    pub frames: Vec<FrameRecord>,
    /// Register names with their resolved values.
    pub registers: Vec<(&'static str, String)>,
    /// Present only if the stack pointer looked like a user-mode address.
    pub stack: Option<Vec<StackSlot>>,
}

impl Report {
    /// Captures a report for `event`.
    ///
    /// `unwinder` must be seeded from the same event. Registers and stack slots are resolved
    /// with one level of pointer dereferencing, frames and the fault address without.
    pub fn capture<S, U, C>(
        space: &S,
        unwinder: &mut U,
        event: &FaultEvent<C>,
        max_frames: usize,
        timestamp: DateTime<FixedOffset>,
    ) -> Self
    where
        S: AddressSpace + ?Sized,
        U: Unwind + ?Sized,
    {
        let resolver = AddressResolver::new(space);
        let registers = &event.registers;

        let frames = walk_stack(
            registers.instruction_pointer(),
            unwinder,
            &resolver,
            max_frames,
        );

        let mut resolved_registers: Vec<_> = registers
            .general_purpose()
            .into_iter()
            .map(|(name, value)| (name, resolver.resolve(value, DEREF_ONCE)))
            .collect();
        resolved_registers.push((
            "RIP",
            resolver.resolve(registers.instruction_pointer(), DEREF_ONCE),
        ));

        let rsp = registers.stack_pointer();
        let stack = is_user_mode(rsp).then(|| {
            (0..STACK_SLOTS)
                .map(|slot| {
                    let offset = slot * 8;
                    StackSlot {
                        offset,
                        value: space
                            .read_u64(rsp + offset)
                            .map(|value| resolver.resolve(value, DEREF_ONCE)),
                    }
                })
                .collect()
        });

        Report {
            timestamp,
            code: event.code,
            location: resolver.resolve(event.address, NO_DEREF),
            access: event.access,
            frames,
            registers: resolved_registers,
            stack,
        }
    }

    /// Writes the report to `path`, replacing whatever a previous crash left there.
    pub fn write_to_path(&self, path: &Path) -> Result<(), Error> {
        let file = File::create(path).map_err(Error::Report)?;
        let mut writer = BufWriter::new(file);
        write!(writer, "{self}").map_err(Error::Report)?;
        writer.flush().map_err(Error::Report)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unhandled native exception")?;
        writeln!(f, "Time: {}", self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f %:z"))?;
        match self.code.name() {
            Some(name) => writeln!(f, "Code: {} ({name})", self.code)?,
            None => writeln!(f, "Code: {}", self.code)?,
        }
        writeln!(f, "Address: {}", self.location)?;
        if let Some(access) = self.access {
            writeln!(f, "Access: {} at {:#x}", access.kind, access.address)?;
        }

        writeln!(f, "\nCall Stack\n{{")?;
        for frame in &self.frames {
            writeln!(f, "  [{}]\t{}", frame.index, frame.location)?;
        }
        writeln!(f, "}}")?;

        writeln!(f, "\nRegisters\n{{")?;
        for (name, value) in &self.registers {
            writeln!(f, "  {name}:\t{value}")?;
        }
        writeln!(f, "}}")?;

        if let Some(ref stack) = self.stack {
            writeln!(f, "\nStack\n{{")?;
            for slot in stack {
                let value = slot.value.as_deref().unwrap_or("<unreadable>");
                writeln!(f, "  [RSP+{:X}]\t{value}", slot.offset)?;
            }
            writeln!(f, "}}")?;
        }

        Ok(())
    }
}
