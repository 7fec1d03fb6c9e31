use std::{
    collections::HashSet,
    io::{self, BufRead, Write},
    str::FromStr,
};

use tracing::{debug, info};

use super::{Command, Replay};
use crate::{
    analyzer::{CallStack, TraceError},
    dis::Instruction,
    syms::{parse_address, SymbolTable},
    tracer::{ParseError, Record},
};

pub const HELP: &str = "Commands:
  bt:          show backtrace
  b <addr>:    add a breakpoint at addr
  c:           continue until a breakpoint
  n:           skip to next instruction
  tc:          skip to next function call
  tr:          skip to ret from current function
  s:           step to the next instr in the current
               function
  ?:           display this help";

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString)]
enum Keyword {
    #[strum(serialize = "b")]
    Break,
    #[strum(serialize = "c")]
    Continue,
    #[strum(serialize = "n")]
    Next,
    #[strum(serialize = "tc")]
    ToCall,
    #[strum(serialize = "tr")]
    ToRet,
    #[strum(serialize = "s")]
    Step,
    #[strum(serialize = "bt")]
    Backtrace,
    #[strum(serialize = "?")]
    Help,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("bad address {0:?}")]
    Address(String),
    #[error("nothing to do")]
    Empty,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let word = words.next().ok_or(CommandError::Empty)?;
        let keyword =
            Keyword::from_str(word).map_err(|_| CommandError::Unknown(word.to_string()))?;

        Ok(match keyword {
            Keyword::Break => Command::Break(
                words
                    .map(|w| parse_address(w).ok_or_else(|| CommandError::Address(w.to_string())))
                    .collect::<Result<_, _>>()?,
            ),
            Keyword::Continue => Command::Continue,
            Keyword::Next => Command::Next,
            Keyword::ToCall => Command::ToCall,
            Keyword::ToRet => Command::ToRet,
            Keyword::Step => Command::Step,
            Keyword::Backtrace => Command::Backtrace,
            Keyword::Help => Command::Help,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    #[error("terminal")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// Interactive replay over a trace, reading commands from `input`.
pub struct Debugger<'a, R: BufRead, W: Write> {
    input: R,
    out: W,
    table: &'a SymbolTable,
    replay: Replay,
    stack: CallStack,
    last: Option<Command>,
}

impl<'a, R: BufRead, W: Write> Debugger<'a, R, W> {
    pub fn new(
        input: R,
        out: W,
        table: &'a SymbolTable,
        entry: u64,
        force_ret: HashSet<u64>,
    ) -> Self {
        Self {
            input,
            out,
            table,
            replay: Replay::new(force_ret.clone()),
            stack: CallStack::new(entry, force_ret),
            last: None,
        }
    }

    pub fn replay(&self) -> &Replay {
        &self.replay
    }

    pub fn run<I>(&mut self, records: I) -> Result<(), ReplError>
    where
        I: IntoIterator<Item = Result<Record, ParseError>>,
    {
        for record in records {
            let Record { line, insn } = record.map_err(TraceError::from)?;
            self.stack
                .feed(&insn)
                .map_err(|source| TraceError::Stack { line, source })?;

            self.echo(&insn)?;
            if self.replay.must_stop(&insn) {
                self.prompt(&insn)?;
            }
        }

        info!("end of trace");
        Ok(())
    }

    fn echo(&mut self, insn: &Instruction) -> io::Result<()> {
        writeln!(
            self.out,
            "{}{}:\t{}",
            ".".repeat(self.stack.depth() - 1),
            self.table.resolve(insn.address),
            insn.format(self.table)
        )
    }

    fn read_command(&mut self) -> io::Result<Command> {
        loop {
            write!(self.out, "> ")?;
            self.out.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                // out of input: keep going the way we were going
                let command = match &self.last {
                    Some(last) if last.resumes() => last.clone(),
                    _ => Command::Continue,
                };
                debug!("end of input, using {:?}", command);
                self.last = Some(command.clone());
                return Ok(command);
            }

            match line.parse::<Command>() {
                Ok(command) => {
                    self.last = Some(command.clone());
                    return Ok(command);
                }
                Err(CommandError::Empty) => {
                    if let Some(last) = &self.last {
                        return Ok(last.clone());
                    }
                }
                Err(e) => writeln!(self.out, "{}", e)?,
            }
        }
    }

    fn prompt(&mut self, insn: &Instruction) -> io::Result<()> {
        loop {
            let command = self.read_command()?;

            match &command {
                Command::Backtrace => {
                    for frame in self.stack.backtrace() {
                        writeln!(self.out, "{}", self.table.resolve(*frame))?;
                    }
                }
                Command::Help => writeln!(self.out, "{}", HELP)?,
                _ => {}
            }

            self.replay.apply(&command, insn);
            if command.resumes() {
                debug!("resuming with {:?}", self.replay.state());
                return Ok(());
            }
        }
    }
}
