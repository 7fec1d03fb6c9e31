use std::{fs::File, io::BufReader, path::Path};

pub mod parser;

pub use parser::{ParseError, Record, TraceReader};

/// Opens an emulator trace for reading.
pub fn open(path: &Path) -> std::io::Result<TraceReader<BufReader<File>>> {
    Ok(TraceReader::new(BufReader::new(File::open(path)?)))
}
