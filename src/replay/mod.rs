//! VCR style stepping through a recorded trace.
//!
//! Nothing is executed: the "debugger" decides, for every instruction of
//! the trace as it streams by, whether to stop there and ask what to do.

pub mod repl;

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::{
    branch::{FrameTracker, Transition},
    dis::Instruction,
};

/// Counts frames entered and left since a step began.
#[derive(Clone, Debug)]
pub struct StepState {
    depth: i64,
    frames: FrameTracker,
}

impl StepState {
    fn new(depth: i64, force_ret: &HashSet<u64>) -> Self {
        Self {
            depth,
            frames: FrameTracker::new(force_ret.clone()),
        }
    }

    fn must_stop(&mut self, insn: &Instruction) -> bool {
        let Transition { returns, called } = self.frames.feed(insn);
        if called {
            self.depth += 1;
        }
        self.depth -= returns as i64;
        self.depth == 0
    }
}

#[derive(Clone, Debug)]
pub enum ReplayState {
    /// run until a breakpoint
    Continue,
    /// stop after every instruction
    Next,
    /// stop when entering a new frame
    ToCall(FrameTracker),
    /// stop once the current frame returns
    ToRet(StepState),
    /// stop once back at the starting depth
    Step(StepState),
}

impl ReplayState {
    /// Consumes one instruction, returns whether to stop after it.
    pub fn must_stop(&mut self, insn: &Instruction) -> bool {
        match self {
            ReplayState::Continue => false,
            ReplayState::Next => true,
            ReplayState::ToCall(frames) => frames.feed(insn).called,
            ReplayState::ToRet(step) | ReplayState::Step(step) => step.must_stop(insn),
        }
    }
}

/// Things the user can ask for at a stop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Break(Vec<u64>),
    Continue,
    Next,
    ToCall,
    ToRet,
    Step,
    Backtrace,
    Help,
}

impl Command {
    /// Whether this command resumes the trace.
    pub fn resumes(&self) -> bool {
        matches!(
            self,
            Command::Continue | Command::Next | Command::ToCall | Command::ToRet | Command::Step
        )
    }
}

pub struct Replay {
    state: ReplayState,
    breakpoints: BTreeSet<u64>,
    force_ret: HashSet<u64>,
}

impl Replay {
    pub fn new(force_ret: HashSet<u64>) -> Self {
        Self {
            state: ReplayState::Next,
            breakpoints: BTreeSet::new(),
            force_ret,
        }
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn breakpoints(&self) -> &BTreeSet<u64> {
        &self.breakpoints
    }

    /// Called for every instruction of the trace.
    pub fn must_stop(&mut self, insn: &Instruction) -> bool {
        if self.breakpoints.contains(&insn.address) {
            debug!("breakpoint at 0x{:x}", insn.address);
            self.state = ReplayState::Next;
        }
        self.state.must_stop(insn)
    }

    /// Applies a command given while stopped at `insn`. A new state sees
    /// `insn` right away so that it starts out knowing where it is.
    pub fn apply(&mut self, command: &Command, insn: &Instruction) {
        let state = match command {
            Command::Break(addresses) => {
                self.breakpoints.extend(addresses);
                return;
            }
            Command::Backtrace | Command::Help => return,
            Command::Continue => ReplayState::Continue,
            Command::Next => ReplayState::Next,
            Command::ToCall => ReplayState::ToCall(FrameTracker::new(self.force_ret.clone())),
            Command::ToRet => ReplayState::ToRet(StepState::new(1, &self.force_ret)),
            Command::Step => ReplayState::Step(StepState::new(0, &self.force_ret)),
        };

        self.state = state;
        self.state.must_stop(insn);
    }
}
