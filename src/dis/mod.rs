//! Decoding of the already-disassembled instruction text found in traces.
//!
//! The emulator prints immediates as `0x<hex>/<unsigned>u/<signed>`, e.g.
//! `call 0x150/336u/336` or `jrNZ 0xfe/254u/-2`. Conditional variants glue
//! the condition onto the mnemonic (`callNZ`, `retC`, `jpZ`). Only the
//! mnemonic prefix and the first operand matter for control flow.

use std::cmp::Ordering;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use thiserror::Error;

use crate::syms::{parse_address, SymbolTable};

/// Bytes taken by a `ret`; a return that falls through lands here.
pub const RET_LEN: u64 = 1;
/// Bytes taken by a `jr`, relative targets count from the following opcode.
pub const JR_LEN: u64 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OpKind {
    Call,
    Return,
    Restart,
    JumpRelative,
    JumpAbsolute,
    Other,
}

impl OpKind {
    fn of(mnemonic: &str) -> Self {
        let mnemonic = mnemonic.to_ascii_lowercase();
        if mnemonic.starts_with("call") {
            OpKind::Call
        } else if mnemonic.starts_with("ret") {
            OpKind::Return
        } else if mnemonic.starts_with("rst") {
            OpKind::Restart
        } else if mnemonic.starts_with("jr") {
            OpKind::JumpRelative
        } else if mnemonic.starts_with("jp") {
            OpKind::JumpAbsolute
        } else {
            OpKind::Other
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OperandError {
    #[error("bad target operand {0:?}")]
    Target(String),
    #[error("bad displacement {0:?}")]
    Displacement(String),
}

/// One retired instruction, as found in the trace.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub address: u64,
    pub text: String,
    /// not a real instruction, marks the cpu jumping to an interrupt vector
    pub is_interrupt: bool,

    kind: OpKind,
    target: Option<u64>,
}

impl Instruction {
    pub fn parse(address: u64, text: impl Into<String>) -> Result<Self, OperandError> {
        let text = text.into();
        let mut words = text.split_whitespace();
        let mnemonic = words.next().unwrap_or_default();
        let operand = words.next();

        let kind = OpKind::of(mnemonic);
        let target = match (kind, operand) {
            (OpKind::Call | OpKind::JumpAbsolute | OpKind::Restart, Some(op)) => absolute(op)?,
            (OpKind::JumpRelative, Some(op)) => {
                let disp = displacement(op)?;
                Some(address.wrapping_add(JR_LEN).wrapping_add_signed(disp))
            }
            _ => None,
        };

        Ok(Self {
            address,
            text,
            is_interrupt: false,
            kind,
            target,
        })
    }

    pub fn interrupt(address: u64) -> Self {
        Self {
            address,
            text: String::from("<interrupt>"),
            is_interrupt: true,
            kind: OpKind::Other,
            target: None,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Where a call, jump or restart goes if taken. `None` for register
    /// jumps like `jp HL`.
    pub fn target(&self) -> Option<u64> {
        self.target
    }

    pub fn mnemonic(&self) -> &str {
        self.text.split_whitespace().next().unwrap_or_default()
    }

    /// Instruction text with targets and memory operands symbolized.
    pub fn format(&self, table: &SymbolTable) -> String {
        lazy_static! {
            static ref HIGH: Regex =
                Regex::new(r"\(0x[fF][fF]00 \+ 0x([0-9a-fA-F]+)(?:/\d+u/-?\d+)?\)").unwrap();
            static ref MEM: Regex = Regex::new(r"\(0x([0-9a-fA-F]+)(?:/\d+u/-?\d+)?\)").unwrap();
            static ref IMM: Regex = Regex::new(r"0x([0-9a-fA-F]+)/\d+u/-?\d+").unwrap();
        }

        if self.is_interrupt {
            return format!("interrupt {}", table.name(self.address));
        }

        match (self.kind, self.target) {
            (
                OpKind::Call | OpKind::JumpAbsolute | OpKind::Restart | OpKind::JumpRelative,
                Some(target),
            ) => format!("{} {}", self.mnemonic(), table.name(target)),
            _ => {
                let hex = |caps: &Captures| u64::from_str_radix(&caps[1], 16).ok();

                let text = HIGH.replace_all(&self.text, |caps: &Captures| match hex(caps) {
                    Some(low) => format!("({})", table.resolve(0xff00 + low)),
                    None => caps[0].to_string(),
                });
                let text = MEM.replace_all(&text, |caps: &Captures| match hex(caps) {
                    Some(adr) => format!("({})", table.resolve(adr)),
                    None => caps[0].to_string(),
                });
                let text = IMM.replace_all(&text, |caps: &Captures| format!("0x{}", &caps[1]));

                text.trim_end().to_string()
            }
        }
    }
}

fn absolute(operand: &str) -> Result<Option<u64>, OperandError> {
    let value = operand.split('/').next().unwrap_or_default();
    if !value.starts_with("0x") && !value.starts_with("0X") {
        // register operand
        return Ok(None);
    }

    parse_address(value)
        .map(Some)
        .ok_or_else(|| OperandError::Target(operand.to_string()))
}

fn displacement(operand: &str) -> Result<i64, OperandError> {
    let err = || OperandError::Displacement(operand.to_string());
    let mut parts = operand.split('/');
    let raw = parts.next().unwrap_or_default();

    // prefer the signed rendering when the emulator printed one
    match parts.nth(1) {
        Some(signed) => signed.parse::<i64>().map_err(|_| err()),
        None => {
            let byte = parse_address(raw).filter(|b| *b <= 0xff).ok_or_else(err)?;
            Ok(byte as u8 as i8 as i64)
        }
    }
}

// deduplication and listing order only care about where the instruction is
impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Instruction {}

impl PartialOrd for Instruction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instruction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}
