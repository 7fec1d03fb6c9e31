use std::collections::HashSet;

use itertools::Itertools;
use tracing::{debug, trace};

use crate::{
    branch::{FrameTracker, Transition},
    dis::Instruction,
};

/// Where the cartridge starts executing.
pub const RESET_VECTOR: u64 = 0x100;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StackError {
    #[error("return at 0x{address:x} with no frame to return from")]
    Underflow { address: u64 },
}

/// Inferred call stack. The bottom frame is the entry point and never goes
/// away; every other frame is keyed by the first address executed in it.
#[derive(Clone, Debug)]
pub struct CallStack {
    frames: Vec<u64>,
    tracker: FrameTracker,
}

impl CallStack {
    pub fn new(entry: u64, force_ret: HashSet<u64>) -> Self {
        Self {
            frames: vec![entry],
            tracker: FrameTracker::new(force_ret),
        }
    }

    pub fn feed(&mut self, insn: &Instruction) -> Result<Transition, StackError> {
        let transition = self.tracker.feed(insn);

        for _ in 0..transition.returns {
            if self.frames.len() == 1 {
                return Err(StackError::Underflow {
                    address: insn.address,
                });
            }
            let frame = self.frames.pop();
            trace!(
                ">>> {:3} RETURN from {:x?} to 0x{:x}",
                self.frames.len(),
                frame,
                insn.address
            );
        }

        if transition.called {
            self.frames.push(insn.address);
            debug!(">>> {:3} Calling 0x{:x}", self.frames.len(), insn.address);
        }

        Ok(transition)
    }

    pub fn current(&self) -> u64 {
        // never empty, the entry frame can't be popped
        self.frames[self.frames.len() - 1]
    }

    /// For tail jumps: the jumping function is done, the target takes its slot.
    pub fn replace_top(&mut self, address: u64) {
        let depth = self.frames.len();
        if let Some(top) = self.frames.last_mut() {
            debug!(">>> {:3} Tail jump 0x{:x} -> 0x{:x}", depth, top, address);
            *top = address;
        }
    }

    /// Frames from the entry point up to the current one.
    pub fn backtrace(&self) -> &[u64] {
        &self.frames
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn inline(&self) -> String {
        self.frames.iter().map(|f| format!("0x{:x}", f)).join(" -> ")
    }
}
