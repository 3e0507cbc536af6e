//! Renders raw addresses into something a human can act on.
//!
//! An address is shown relative to the image that contains it (`game.exe+1A2B`), followed by
//! the debug symbol covering it if there is one. When there is no symbol, the address may be a
//! pointer to something interesting, so the value it points to is resolved as well, at most
//! [`DEREF_ONCE`] levels deep.

use std::fmt::Write;
use std::ops::Range;

use crate::platform::AddressSpace;

/// Addresses that can plausibly be user-mode pointers.
///
/// Values outside of this range are never dereferenced.
pub const USER_MODE_RANGE: Range<u64> = 0x10000..0x7FFF_FFFE_0000;

/// Do not follow pointers.
pub const NO_DEREF: u32 = 0;

/// Follow a pointer once, but not the pointer it points to.
pub const DEREF_ONCE: u32 = 1;

/// Returns `true` if `addr` lies in [`USER_MODE_RANGE`].
pub fn is_user_mode(addr: u64) -> bool {
    USER_MODE_RANGE.contains(&addr)
}

/// Resolves addresses against an [`AddressSpace`].
#[derive(Clone, Copy, Debug)]
pub struct AddressResolver<'a, S: ?Sized> {
    space: &'a S,
}

impl<'a, S> AddressResolver<'a, S>
where
    S: AddressSpace + ?Sized,
{
    pub fn new(space: &'a S) -> Self {
        Self { space }
    }

    /// Renders `addr`, following pointers up to `depth` levels.
    ///
    /// The rendering degrades gracefully and never fails:
    ///
    ///  - `module.dll+1A2B` when the owning image is known, bare `7FF61A2B` otherwise.
    ///  - A tab and `(symbol+0x10)` if a debug symbol covers the address.
    ///  - Otherwise, if `depth` allows it and the address is a plausible user-mode pointer,
    ///    ` [pointee]` with the non-zero pointee resolved at `depth - 1`.
    pub fn resolve(&self, addr: u64, depth: u32) -> String {
        let mut rendered = match self.space.module_at(addr) {
            Some(module) => format!("{}+{:X}", module.file_name(), addr.wrapping_sub(module.base)),
            None => format!("{addr:X}"),
        };

        if let Some(symbol) = self.space.symbol_at(addr) {
            if symbol.displacement != 0 {
                write!(rendered, "\t({}+0x{:X})", symbol.name, symbol.displacement).ok();
            } else {
                write!(rendered, "\t({})", symbol.name).ok();
            }
            return rendered;
        }

        if depth > 0 && is_user_mode(addr) {
            if let Some(value) = self.space.read_u64(addr).filter(|&value| value != 0) {
                write!(rendered, " [{}]", self.resolve(value, depth - 1)).ok();
            }
        }

        rendered
    }
}
