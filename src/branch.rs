//! Detectors that recover control transfers from consecutive instructions.
//!
//! A call in the trace only states where it wants to go; whether it went
//! there is visible on the next record. Same for returns, whose destination
//! is simply the next address. So every detector looks one instruction back.

use std::collections::HashSet;

use crate::dis::{Instruction, OpKind, RET_LEN};

/// Fires when the previous instruction was a `kind` transfer that landed
/// on the current one.
#[derive(Clone, Debug)]
pub struct JumpDetector {
    kind: OpKind,
    pending: Option<u64>,
}

impl JumpDetector {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            pending: None,
        }
    }

    pub fn call() -> Self {
        Self::new(OpKind::Call)
    }

    pub fn restart() -> Self {
        Self::new(OpKind::Restart)
    }

    pub fn happened(&mut self, insn: &Instruction) -> bool {
        let landed = self.pending.take() == Some(insn.address);

        if insn.kind() == self.kind {
            self.pending = insn.target();
        }

        landed
    }
}

#[derive(Clone, Copy, Debug)]
struct Previous {
    address: u64,
    is_return: bool,
}

/// Fires when the previous instruction returned.
#[derive(Clone, Debug, Default)]
pub struct ReturnDetector {
    force_ret: HashSet<u64>,
    previous: Option<Previous>,
}

impl ReturnDetector {
    pub fn new(force_ret: HashSet<u64>) -> Self {
        Self {
            force_ret,
            previous: None,
        }
    }

    pub fn happened(&mut self, insn: &Instruction) -> bool {
        let returned = match self.previous {
            Some(prev) if self.force_ret.contains(&prev.address) => true,
            // a conditional return that was not taken just falls through
            Some(prev) => prev.is_return && insn.address != prev.address + RET_LEN,
            None => false,
        };

        self.previous = Some(Previous {
            address: insn.address,
            is_return: insn.kind() == OpKind::Return,
        });

        returned
    }
}

/// Something opened a new frame: a call, a restart or an interrupt.
#[derive(Clone, Debug)]
pub struct CallEvent {
    call: JumpDetector,
    rst: JumpDetector,
}

impl Default for CallEvent {
    fn default() -> Self {
        Self {
            call: JumpDetector::call(),
            rst: JumpDetector::restart(),
        }
    }
}

impl CallEvent {
    pub fn happened(&mut self, insn: &Instruction) -> bool {
        // both detectors must see every instruction
        let call = self.call.happened(insn);
        let rst = self.rst.happened(insn);
        insn.is_interrupt || call || rst
    }
}

/// What feeding one instruction did to the frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Frames closed. Two when a handler returns onto the landing of a return.
    pub returns: usize,
    pub called: bool,
}

#[derive(Clone, Debug)]
struct Preempted {
    call: CallEvent,
    previous: Option<Previous>,
    // frames opened inside the handler and still open
    inner: usize,
}

/// Call and return detection for a whole trace.
///
/// An interrupt can be taken between any two instructions, including a
/// `call` and its target or a `retNZ` and its fall-through. The handler is
/// therefore kept out of the lookback of the code it preempted: that
/// lookback is put aside at the interrupt entry and picked up again once
/// the handler returns.
#[derive(Clone, Debug, Default)]
pub struct FrameTracker {
    call: CallEvent,
    ret: ReturnDetector,
    preempted: Vec<Preempted>,
}

impl FrameTracker {
    pub fn new(force_ret: HashSet<u64>) -> Self {
        Self {
            call: CallEvent::default(),
            ret: ReturnDetector::new(force_ret),
            preempted: Vec::new(),
        }
    }

    pub fn feed(&mut self, insn: &Instruction) -> Transition {
        if insn.is_interrupt {
            self.preempted.push(Preempted {
                call: std::mem::take(&mut self.call),
                previous: self.ret.previous.take(),
                inner: 0,
            });
            return Transition {
                returns: 0,
                called: true,
            };
        }

        let mut returns = 0;
        while self.ret.happened(insn) {
            returns += 1;
            let handler = match self.preempted.last_mut() {
                Some(handler) => handler,
                None => break,
            };
            if handler.inner > 0 {
                handler.inner -= 1;
                break;
            }

            // handler done, the preempted code sees `insn` next
            if let Some(Preempted { call, previous, .. }) = self.preempted.pop() {
                self.call = call;
                self.ret.previous = previous;
            }
        }

        let called = self.call.happened(insn);
        if called {
            if let Some(handler) = self.preempted.last_mut() {
                handler.inner += 1;
            }
        }

        Transition { returns, called }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{CallEvent, FrameTracker, JumpDetector, ReturnDetector, Transition};
    use crate::dis::Instruction;

    fn insn(address: u64, text: &str) -> Instruction {
        Instruction::parse(address, text).unwrap()
    }

    fn feed<F: FnMut(&Instruction) -> bool>(f: F, trace: &[Instruction]) -> Vec<bool> {
        trace.iter().map(f).collect()
    }

    #[test]
    fn call_lands() {
        let mut det = JumpDetector::call();
        let trace = [
            insn(0x100, "call 0x150/336u/336"),
            insn(0x150, "nop"),
            insn(0x151, "nop"),
        ];
        assert_eq!(feed(|i| det.happened(i), &trace), [false, true, false]);
    }

    #[test]
    fn call_not_taken() {
        let mut det = JumpDetector::call();
        let trace = [insn(0x100, "callNZ 0x150/336u/336"), insn(0x103, "nop")];
        assert_eq!(feed(|i| det.happened(i), &trace), [false, false]);
    }

    #[test]
    fn call_into_call() {
        let mut det = JumpDetector::call();
        let trace = [
            insn(0x100, "call 0x150"),
            insn(0x150, "call 0x200"),
            insn(0x200, "nop"),
        ];
        assert_eq!(feed(|i| det.happened(i), &trace), [false, true, true]);
    }

    #[test]
    fn restart() {
        let mut det = JumpDetector::restart();
        let trace = [insn(0x100, "rst 0x38"), insn(0x38, "nop")];
        assert_eq!(feed(|i| det.happened(i), &trace), [false, true]);
    }

    #[test]
    fn ret_taken_and_not() {
        let mut det = ReturnDetector::default();
        let trace = [
            insn(0x155, "retNZ"),
            insn(0x156, "nop"), // not taken
            insn(0x157, "ret "),
            insn(0x103, "nop"), // taken
        ];
        assert_eq!(feed(|i| det.happened(i), &trace), [false, false, false, true]);
    }

    #[test]
    fn forced_return() {
        let mut det = ReturnDetector::new(HashSet::from([0x2a3]));
        let trace = [
            insn(0x2a2, "nop"),
            insn(0x2a3, "jp 0x400/1024u/1024"),
            insn(0x400, "nop"),
        ];
        assert_eq!(feed(|i| det.happened(i), &trace), [false, false, true]);
    }

    #[test]
    fn interrupt_is_a_call() {
        let mut event = CallEvent::default();
        let trace = [
            insn(0x200, "nop"),
            Instruction::interrupt(0x40),
            insn(0x40, "push AF"),
        ];
        assert_eq!(feed(|i| event.happened(i), &trace), [false, true, false]);
    }

    #[test]
    fn combined_call_and_restart() {
        let mut event = CallEvent::default();
        let trace = [
            insn(0x100, "call 0x150"),
            insn(0x150, "rst 0x08"),
            insn(0x08, "nop"),
        ];
        assert_eq!(feed(|i| event.happened(i), &trace), [false, true, true]);
    }

    fn transitions(trace: &[Instruction]) -> Vec<(usize, bool)> {
        let mut frames = FrameTracker::default();
        trace
            .iter()
            .map(|i| {
                let Transition { returns, called } = frames.feed(i);
                (returns, called)
            })
            .collect()
    }

    #[test]
    fn interrupt_between_call_and_target() {
        let trace = [
            insn(0x100, "call 0x150"),
            Instruction::interrupt(0x40),
            insn(0x40, "reti"),
            insn(0x150, "nop"),
            insn(0x151, "ret "),
            insn(0x103, "nop"),
        ];
        assert_eq!(
            transitions(&trace),
            [(0, false), (0, true), (0, false), (1, true), (0, false), (1, false)]
        );
    }

    #[test]
    fn interrupt_after_untaken_return() {
        let trace = [
            insn(0x150, "retNZ"),
            Instruction::interrupt(0x40),
            insn(0x40, "reti"),
            insn(0x151, "nop"),
        ];
        assert_eq!(transitions(&trace), [(0, false), (0, true), (0, false), (1, false)]);
    }

    #[test]
    fn interrupt_before_return_lands() {
        let trace = [
            insn(0x155, "ret "),
            Instruction::interrupt(0x40),
            insn(0x40, "reti"),
            insn(0x103, "nop"),
        ];
        // the handler and the function both close on the landing
        assert_eq!(transitions(&trace), [(0, false), (0, true), (0, false), (2, false)]);
    }

    #[test]
    fn calls_inside_handler() {
        let trace = [
            insn(0x200, "nop"),
            Instruction::interrupt(0x50),
            insn(0x50, "call 0x300"),
            insn(0x300, "ret "),
            insn(0x53, "reti"),
            insn(0x201, "nop"),
        ];
        assert_eq!(
            transitions(&trace),
            [(0, false), (0, true), (0, false), (0, true), (1, false), (1, false)]
        );
    }

    #[test]
    fn nested_interrupts() {
        let trace = [
            insn(0x100, "call 0x150"),
            Instruction::interrupt(0x40),
            insn(0x40, "ei"),
            Instruction::interrupt(0x50),
            insn(0x50, "reti"),
            insn(0x41, "reti"),
            insn(0x150, "nop"),
        ];
        assert_eq!(
            transitions(&trace),
            [
                (0, false),
                (0, true),
                (0, false),
                (0, true),
                (0, false),
                (1, false),
                (1, true)
            ]
        );
    }
}
