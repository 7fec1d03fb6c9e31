use std::{
    collections::{BTreeMap, HashSet},
    io::{self, Write},
};

use serde_json::json;
use tracing::trace;

use super::stack::{CallStack, StackError};
use crate::{dis::Instruction, syms::SymbolTable};

/// Everything executed while one frame was on top of the stack, by address.
#[derive(Clone, Debug, Default)]
pub struct Function {
    insns: Vec<Instruction>,
}

impl Function {
    /// Keeps the first visit of each address.
    pub fn log(&mut self, insn: &Instruction) {
        if let Err(pos) = self.insns.binary_search(insn) {
            self.insns.insert(pos, insn.clone());
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.insns
    }

    pub fn show<W: Write>(&self, table: &SymbolTable, out: &mut W) -> io::Result<()> {
        for i in &self.insns {
            writeln!(out, "{}  {}", table.resolve_aligned(i.address), i.format(table))?;
        }
        Ok(())
    }
}

/// Functions rebuilt from a trace, keyed by the address their frame started at.
#[derive(Clone, Debug)]
pub struct Program {
    stack: CallStack,
    funs: BTreeMap<u64, Function>,
    tail_jumps: HashSet<u64>,
}

impl Program {
    pub fn new(stack: CallStack, tail_jumps: HashSet<u64>) -> Self {
        Self {
            stack,
            funs: BTreeMap::new(),
            tail_jumps,
        }
    }

    /// Updates the stack for `insn`, then files `insn` under the frame that
    /// is on top afterwards.
    pub fn log(&mut self, insn: &Instruction) -> Result<(), StackError> {
        let transition = self.stack.feed(insn)?;
        if transition.returns > 0 || transition.called {
            trace!(">>> {:3} {}", self.stack.depth(), self.stack.inline());
        }

        trace!(
            "{}0x{:x}:\t{}",
            ".".repeat(self.stack.depth() - 1),
            insn.address,
            insn.text
        );

        // handlers run on top of whatever they interrupted
        if !insn.is_interrupt {
            self.funs.entry(self.stack.current()).or_default().log(insn);
        }

        if self.tail_jumps.contains(&insn.address) {
            if let Some(target) = insn.target() {
                self.stack.replace_top(target);
            }
        }

        Ok(())
    }

    pub fn stack(&self) -> &CallStack {
        &self.stack
    }

    pub fn functions(&self) -> &BTreeMap<u64, Function> {
        &self.funs
    }

    pub fn get(&self, key: u64) -> Option<&Function> {
        self.funs.get(&key)
    }

    /// Union of both programs' functions. The stack of `self` is kept.
    pub fn merge(mut self, other: Program) -> Self {
        for (key, fun) in other.funs {
            let mine = self.funs.entry(key).or_default();
            for insn in fun.insns {
                mine.log(&insn);
            }
        }
        self
    }

    pub fn render<W: Write>(&self, table: &SymbolTable, out: &mut W) -> io::Result<()> {
        for (key, fun) in &self.funs {
            writeln!(out, "-------{}", table.resolve(*key))?;
            fun.show(table, out)?;
        }
        writeln!(out, "-------")
    }

    pub fn to_json(&self, table: &SymbolTable) -> serde_json::Value {
        let funs: Vec<_> = self
            .funs
            .iter()
            .map(|(key, fun)| {
                let insns: Vec<_> = fun
                    .insns
                    .iter()
                    .map(|i| {
                        json!({
                            "a": i.address,
                            "s": table.resolve(i.address),
                            "k": i.kind(),
                            "c": i.format(table),
                        })
                    })
                    .collect();
                json!({"key": key, "name": table.resolve(*key), "insns": insns})
            })
            .collect();

        json!({ "functions": funs })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{Function, Program};
    use crate::{
        analyzer::stack::{CallStack, RESET_VECTOR},
        dis::Instruction,
        syms::{Symbol, SymbolTable},
    };

    fn insn(address: u64, text: &str) -> Instruction {
        Instruction::parse(address, text).unwrap()
    }

    fn program() -> Program {
        Program::new(CallStack::new(RESET_VECTOR, HashSet::new()), HashSet::new())
    }

    fn addresses(p: &Program, key: u64) -> Vec<u64> {
        p.get(key)
            .unwrap()
            .instructions()
            .iter()
            .map(|i| i.address)
            .collect()
    }

    #[test]
    fn dedup_and_sort() {
        let mut f = Function::default();
        f.log(&insn(0x10, "nop"));
        f.log(&insn(0x08, "nop"));
        f.log(&insn(0x10, "nop"));
        f.log(&insn(0x0c, "nop"));
        let adrs: Vec<_> = f.instructions().iter().map(|i| i.address).collect();
        assert_eq!(adrs, [0x08, 0x0c, 0x10]);
    }

    #[test]
    fn loop_visits_once() {
        let mut p = program();
        let body = [
            insn(0x100, "nop"),
            insn(0x101, "dec B"),
            insn(0x102, "jrNZ 0xfd/253u/-3"),
        ];
        for _ in 0..3 {
            for i in &body {
                p.log(i).unwrap();
            }
        }
        assert_eq!(addresses(&p, 0x100), [0x100, 0x101, 0x102]);
    }

    #[test]
    fn helper_call() {
        let mut p = program();
        for i in [
            insn(0x100, "call 0x150"),
            insn(0x150, "nop"),
            insn(0x155, "ret "),
            insn(0x103, "nop"),
        ] {
            p.log(&i).unwrap();
        }

        assert_eq!(p.functions().len(), 2);
        assert_eq!(addresses(&p, 0x100), [0x100, 0x103]);
        assert_eq!(addresses(&p, 0x150), [0x150, 0x155]);

        let table = SymbolTable::new(vec![
            Symbol::point("entry", 0x100),
            Symbol::range("helper", 0x150, 0x160),
        ]);
        let mut out = Vec::new();
        p.render(&table, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<_> = out.lines().collect();

        assert_eq!(lines[0], "-------entry(0x100)");
        assert!(lines[1].trim_start().starts_with("entry(0x100)  call helper"));
        assert_eq!(lines[3], "-------helper(0x150)");
        assert!(lines[5].ends_with("helper+0x5  ret"));
        assert_eq!(lines.last(), Some(&"-------"));
    }

    #[test]
    fn interrupt_not_attributed() {
        let mut p = program();
        for i in [
            insn(0x100, "nop"),
            Instruction::interrupt(0x40),
            insn(0x40, "push AF"),
            insn(0x41, "reti"),
            insn(0x101, "nop"),
        ] {
            p.log(&i).unwrap();
        }

        assert_eq!(addresses(&p, 0x100), [0x100, 0x101]);
        assert_eq!(addresses(&p, 0x40), [0x40, 0x41]);
        assert_eq!(p.stack().depth(), 1);
    }

    #[test]
    fn tail_jump_moves_frame() {
        let mut p = Program::new(
            CallStack::new(RESET_VECTOR, HashSet::new()),
            HashSet::from([0x152]),
        );
        for i in [
            insn(0x100, "call 0x150"),
            insn(0x150, "nop"),
            insn(0x152, "jp 0x400/1024u/1024"),
            insn(0x400, "nop"),
            insn(0x401, "ret "),
            insn(0x103, "nop"),
        ] {
            p.log(&i).unwrap();
        }

        assert_eq!(addresses(&p, 0x150), [0x150, 0x152]);
        assert_eq!(addresses(&p, 0x400), [0x400, 0x401]);
        assert_eq!(addresses(&p, 0x100), [0x100, 0x103]);
    }

    #[test]
    fn merge_unions() {
        let mut a = program();
        let mut b = program();
        a.log(&insn(0x100, "nop")).unwrap();
        a.log(&insn(0x101, "nop")).unwrap();
        b.log(&insn(0x101, "nop")).unwrap();
        b.log(&insn(0x102, "nop")).unwrap();

        let merged = a.merge(b);
        assert_eq!(addresses(&merged, 0x100), [0x100, 0x101, 0x102]);
    }

    #[test]
    fn json_listing() {
        let mut p = program();
        p.log(&insn(0x100, "nop")).unwrap();
        let v = p.to_json(&SymbolTable::default());
        assert_eq!(v["functions"][0]["key"], 0x100);
        assert_eq!(v["functions"][0]["insns"][0]["k"], "other");
        assert_eq!(v["functions"][0]["insns"][0]["c"], "nop");
    }

    #[test]
    fn interrupt_between_call_and_target() {
        let mut p = program();
        for i in [
            insn(0x100, "call 0x150/336u/336"),
            Instruction::interrupt(0x40),
            insn(0x40, "reti"),
            insn(0x150, "nop"),
            insn(0x151, "ret "),
            insn(0x103, "nop"),
        ] {
            p.log(&i).unwrap();
        }

        assert_eq!(addresses(&p, 0x100), [0x100, 0x103]);
        assert_eq!(addresses(&p, 0x40), [0x40]);
        assert_eq!(addresses(&p, 0x150), [0x150, 0x151]);
    }
}
