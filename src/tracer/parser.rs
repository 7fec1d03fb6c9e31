use std::io::BufRead;

use tracing::{trace, warn};

use crate::{
    dis::{Instruction, OpKind, OperandError},
    syms::parse_address,
};

/// What a single line of emulator output means to us.
#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    /// `0x<pc>\t<opcode>\t<text>`
    Instruction { address: u64, text: &'a str },
    /// `interrupt caught by <vector>`
    Interrupt(u64),
    /// memory accesses, events, anything else
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: bad address {text:?}")]
    Address { line: usize, text: String },
    #[error("line {line}: missing instruction text")]
    MissingText { line: usize },
    #[error("line {line}: {source}")]
    Operand {
        line: usize,
        #[source]
        source: OperandError,
    },
    #[error("reading trace")]
    Io(#[from] std::io::Error),
}

const INTERRUPT_PREFIX: &str = "interrupt caught by ";

pub fn parse_line(line_no: usize, line: &str) -> Result<Message<'_>, ParseError> {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');

    if line.starts_with("0x") {
        let mut fields = line.splitn(3, '\t');
        let address = fields.next().unwrap_or_default();
        let address = parse_address(address).ok_or_else(|| ParseError::Address {
            line: line_no,
            text: address.to_string(),
        })?;

        // the opcode byte column is optional
        let text = match (fields.next(), fields.next()) {
            (Some(_opcode), Some(text)) => text,
            (Some(text), None) => text,
            _ => return Err(ParseError::MissingText { line: line_no }),
        };

        return Ok(Message::Instruction { address, text });
    }

    if let Some(vector) = line.strip_prefix(INTERRUPT_PREFIX) {
        let address = parse_address(vector.trim()).ok_or_else(|| ParseError::Address {
            line: line_no,
            text: vector.to_string(),
        })?;
        return Ok(Message::Interrupt(address));
    }

    Ok(Message::Ignored)
}

/// One trace record with the line it came from.
#[derive(Debug, Clone)]
pub struct Record {
    pub line: usize,
    pub insn: Instruction,
}

/// Turns emulator output into instruction records, in execution order.
pub struct TraceReader<R: BufRead> {
    reader: R,
    line: usize,
    buf: String,
    // `rst` prints the same marker as a hardware interrupt
    last_was_rst: bool,
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
            last_was_rst: false,
        }
    }

    fn next_record(&mut self) -> Result<Option<Record>, ParseError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;
            let line = self.line;

            let insn = match parse_line(line, &self.buf)? {
                Message::Instruction { address, text } => Instruction::parse(address, text)
                    .map_err(|source| ParseError::Operand { line, source })?,
                Message::Interrupt(vector) if self.last_was_rst => {
                    trace!("line {}: rst to 0x{:x}, not an interrupt", line, vector);
                    self.last_was_rst = false;
                    continue;
                }
                Message::Interrupt(vector) => Instruction::interrupt(vector),
                Message::Ignored => continue,
            };

            self.last_was_rst = insn.kind() == OpKind::Restart;
            return Ok(Some(Record { line, insn }));
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<Record, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                warn!("trace parse error: {}", e);
                Some(Err(e))
            }
        }
    }
}
