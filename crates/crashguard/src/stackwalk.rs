//! Unwinds the faulting thread into an ordered list of frames.
//!
//! The walk only renders instruction addresses. It never follows pointers, so a broken frame
//! chain cannot make it read memory on its own.

use crate::platform::{AddressSpace, Unwind};
use crate::resolve::{AddressResolver, NO_DEREF};
use crate::types::FrameRecord;

/// Upper bound on the number of frames recorded for a single stack.
pub const DEFAULT_MAX_FRAMES: usize = 256;

/// Walks the stack of a faulting thread.
///
/// The first frame is always `instruction_addr` itself. After that, the unwinder is stepped
/// until one of the following happens:
///
///  - the unwinder cannot step any further,
///  - the caller frame has a return address of zero,
///  - the return address equals the frame's own instruction address, which is how a corrupted
///    frame chain typically loops,
///  - `max_frames` frames have been recorded.
pub fn walk_stack<U, S>(
    instruction_addr: u64,
    unwinder: &mut U,
    resolver: &AddressResolver<'_, S>,
    max_frames: usize,
) -> Vec<FrameRecord>
where
    U: Unwind + ?Sized,
    S: AddressSpace + ?Sized,
{
    let mut frames = Vec::new();
    let record = |frames: &mut Vec<FrameRecord>, addr: u64| {
        frames.push(FrameRecord {
            index: frames.len(),
            instruction_addr: addr,
            location: resolver.resolve(addr, NO_DEREF),
        });
    };

    record(&mut frames, instruction_addr);

    while frames.len() < max_frames {
        let Some(frame) = unwinder.step() else {
            break;
        };

        record(&mut frames, frame.instruction_addr);

        if frame.return_addr == 0 || frame.return_addr == frame.instruction_addr {
            break;
        }
    }

    tracing::trace!(frames = frames.len(), "walked faulting stack");
    frames
}
