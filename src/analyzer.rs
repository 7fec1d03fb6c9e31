//! Rebuilding functions from a flat instruction trace.

pub mod program;
pub mod stack;

pub use program::{Function, Program};
pub use stack::{CallStack, StackError, RESET_VECTOR};

use tracing::info;

use crate::{
    syms::Overrides,
    tracer::{ParseError, Record},
};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("line {line}: {source}")]
    Stack {
        line: usize,
        #[source]
        source: StackError,
    },
}

/// A run that stopped early. The program holds everything up to the failure.
#[derive(Debug)]
pub struct Truncated {
    pub program: Program,
    pub error: TraceError,
}

/// Feeds every record into a fresh [`Program`], stopping at the first error.
pub fn reconstruct<I>(
    records: I,
    overrides: &Overrides,
    entry: u64,
) -> Result<Program, Box<Truncated>>
where
    I: IntoIterator<Item = Result<Record, ParseError>>,
{
    let stack = CallStack::new(entry, overrides.force_ret.clone());
    let mut program = Program::new(stack, overrides.tail_jumps.clone());

    let mut count = 0usize;
    for record in records {
        let error = match record {
            Ok(Record { line, insn }) => match program.log(&insn) {
                Ok(()) => {
                    count += 1;
                    continue;
                }
                Err(source) => TraceError::Stack { line, source },
            },
            Err(e) => e.into(),
        };

        return Err(Box::new(Truncated { program, error }));
    }

    info!(
        "{} instructions in {} functions",
        count,
        program.functions().len()
    );

    Ok(program)
}
