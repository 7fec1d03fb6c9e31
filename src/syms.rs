use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    str::FromStr,
};

use itertools::Itertools;
use tracing::{info, warn};

/// Width of the address column in listings.
pub const ALIGNED_WIDTH: usize = 24;

#[derive(Debug)]
pub struct SymbolReference<'a> {
    pub symbol: &'a Symbol,
    pub offset: u64, // how much after the start of the symbol
}

impl Display for SymbolReference<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.offset == 0 {
            write!(f, "{}(0x{:x})", self.symbol.name, self.symbol.from)
        } else {
            write!(f, "{}+0x{:x}", self.symbol.name, self.offset)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub from: u64,
    /// exclusive
    pub to: u64,
}

impl Symbol {
    pub fn point(name: impl Into<String>, at: u64) -> Self {
        Self {
            name: name.into(),
            from: at,
            to: at + 1,
        }
    }

    pub fn range(name: impl Into<String>, from: u64, to: u64) -> Self {
        Self {
            name: name.into(),
            from,
            to,
        }
    }
}

/// Static address to name index. Build it once, then share it by reference.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(mut symbols: Vec<Symbol>) -> Self {
        symbols.sort_by_key(|s| s.from);

        for (a, b) in symbols.iter().tuple_windows() {
            if b.from < a.to {
                // lookups will pick `b` for the shared part
                warn!(
                    "symbol {} at 0x{:x} overlaps {} (0x{:x}-0x{:x})",
                    b.name, b.from, a.name, a.from, a.to
                );
            }
        }

        Self { symbols }
    }

    pub fn lookup(&self, adr: u64) -> Option<SymbolReference<'_>> {
        // rightmost symbol starting at or before adr
        let idx = self.symbols.partition_point(|s| s.from <= adr);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;

        (adr < symbol.to).then(|| SymbolReference {
            offset: adr - symbol.from,
            symbol,
        })
    }

    /// `name(0x150)`, `name+0x5` or the bare address. Never fails.
    pub fn resolve(&self, adr: u64) -> String {
        match self.lookup(adr) {
            Some(sym) => sym.to_string(),
            None => format!("0x{:x}", adr),
        }
    }

    pub fn resolve_aligned(&self, adr: u64) -> String {
        format!("{:>width$}", self.resolve(adr), width = ALIGNED_WIDTH)
    }

    /// Plain name for call/jump targets, the address if unnamed.
    pub fn name(&self, adr: u64) -> String {
        match self.lookup(adr) {
            Some(SymbolReference { symbol, offset: 0 }) => symbol.name.clone(),
            Some(sym) => sym.to_string(),
            None => format!("0x{:x}", adr),
        }
    }
}

/// Addresses that need special handling when inferring the call stack.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    /// executing one of these always returns, whatever the opcode says
    pub force_ret: HashSet<u64>,
    /// jumps that enter another function without a call
    pub tail_jumps: HashSet<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("line {line}: bad address {text:?}")]
    Address { line: usize, text: String },
    #[error("line {line}: missing symbol name")]
    MissingName { line: usize },
    #[error("line {line}: empty range 0x{from:x}-0x{to:x}")]
    EmptyRange { line: usize, from: u64, to: u64 },
    #[error("line {line}: trailing junk {text:?}")]
    Trailing { line: usize, text: String },
}

pub fn parse_address(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}

/// The parsed content of a symbol file.
#[derive(Debug, Default)]
pub struct SymbolFile {
    pub table: SymbolTable,
    pub overrides: Overrides,
}

impl FromStr for SymbolFile {
    type Err = SymbolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut symbols = Vec::new();
        let mut overrides = Overrides::default();

        for (idx, raw) in input.lines().enumerate() {
            let line = idx + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            let mut words = content.split_whitespace();

            let first = match words.next() {
                Some(first) => first,
                None => continue,
            };
            let second = words.next();
            if let Some(extra) = words.next() {
                return Err(SymbolError::Trailing {
                    line,
                    text: extra.to_string(),
                });
            }

            let address = |text: &str| {
                parse_address(text).ok_or_else(|| SymbolError::Address {
                    line,
                    text: text.to_string(),
                })
            };

            match (first, second) {
                ("force-ret", Some(adr)) => {
                    overrides.force_ret.insert(address(adr)?);
                }
                ("tail-jump", Some(adr)) => {
                    overrides.tail_jumps.insert(address(adr)?);
                }
                (_, None) => return Err(SymbolError::MissingName { line }),
                (span, Some(name)) => {
                    let symbol = match span.split_once('-') {
                        Some((from, to)) => {
                            let (from, to) = (address(from)?, address(to)?);
                            if to <= from {
                                return Err(SymbolError::EmptyRange { line, from, to });
                            }
                            Symbol::range(name, from, to)
                        }
                        None => Symbol::point(name, address(span)?),
                    };
                    symbols.push(symbol);
                }
            }
        }

        info!(
            "loaded {} symbols, {} forced returns, {} tail jumps",
            symbols.len(),
            overrides.force_ret.len(),
            overrides.tail_jumps.len()
        );

        Ok(Self {
            table: SymbolTable::new(symbols),
            overrides,
        })
    }
}
