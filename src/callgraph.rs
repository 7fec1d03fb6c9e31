use std::{
    collections::{BTreeMap, HashSet},
    io::{self, Write},
};

use itertools::Itertools;

use crate::{analyzer::Program, dis::OpKind, syms::SymbolTable};

/// Who calls (or jumps into) whom, as seen in a reconstructed program.
#[derive(Debug, Default)]
pub struct CallGraph {
    edges: BTreeMap<u64, Vec<u64>>,
}

impl CallGraph {
    pub fn from_program(program: &Program) -> Self {
        let mut edges = BTreeMap::new();

        for (key, fun) in program.functions() {
            let local: HashSet<u64> = fun.instructions().iter().map(|i| i.address).collect();

            let callees = fun
                .instructions()
                .iter()
                .filter_map(|i| match (i.kind(), i.target()) {
                    (OpKind::Call | OpKind::Restart, Some(t)) => Some(t),
                    // jumps inside the function are just control flow
                    (OpKind::JumpAbsolute, Some(t)) if !local.contains(&t) => Some(t),
                    _ => None,
                })
                .unique()
                .collect();

            edges.insert(*key, callees);
        }

        Self { edges }
    }

    pub fn callees(&self, caller: u64) -> &[u64] {
        self.edges.get(&caller).map(Vec::as_slice).unwrap_or_default()
    }

    /// Functions nobody calls.
    pub fn roots(&self) -> Vec<u64> {
        let called: HashSet<u64> = self.edges.values().flatten().copied().collect();
        self.edges
            .keys()
            .copied()
            .filter(|k| !called.contains(k))
            .collect()
    }

    pub fn render<W: Write>(&self, table: &SymbolTable, out: &mut W) -> io::Result<()> {
        for root in self.roots() {
            writeln!(out, "{}", table.name(root))?;
            self.walk(table, out, &mut vec![root])?;
            writeln!(out)?;
        }
        Ok(())
    }

    fn walk<W: Write>(
        &self,
        table: &SymbolTable,
        out: &mut W,
        path: &mut Vec<u64>,
    ) -> io::Result<()> {
        let (cur, before) = match path.split_last() {
            Some((cur, before)) => (*cur, before),
            None => return Ok(()),
        };
        if before.contains(&cur) {
            return Ok(());
        }
        for callee in self.callees(cur) {
            writeln!(out, "{}{}", "    ".repeat(path.len()), table.name(*callee))?;
            path.push(*callee);
            self.walk(table, out, path)?;
            path.pop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::CallGraph;
    use crate::{
        analyzer::{CallStack, Program, RESET_VECTOR},
        dis::Instruction,
        syms::{Symbol, SymbolTable},
    };

    fn insn(address: u64, text: &str) -> Instruction {
        Instruction::parse(address, text).unwrap()
    }

    fn program(trace: &[Instruction]) -> Program {
        let mut p = Program::new(CallStack::new(RESET_VECTOR, HashSet::new()), HashSet::new());
        for i in trace {
            p.log(i).unwrap();
        }
        p
    }

    #[test]
    fn tree() {
        let p = program(&[
            insn(0x100, "call 0x150"),
            insn(0x150, "call 0x200"),
            insn(0x200, "ret "),
            insn(0x153, "jp 0x156"),
            insn(0x156, "ret "),
            insn(0x103, "rst 0x38"),
            insn(0x38, "ret "),
            insn(0x104, "nop"),
        ]);
        let graph = CallGraph::from_program(&p);

        assert_eq!(graph.roots(), [0x100]);
        assert_eq!(graph.callees(0x100), [0x150, 0x38]);
        assert_eq!(graph.callees(0x150), [0x200]);

        let table = SymbolTable::new(vec![
            Symbol::point("main", 0x100),
            Symbol::range("helper", 0x150, 0x160),
            Symbol::point("leaf", 0x200),
        ]);
        let mut out = Vec::new();
        graph.render(&table, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "main\n    helper\n        leaf\n    0x38\n\n"
        );
    }

    #[test]
    fn recursion_terminates() {
        let p = program(&[
            insn(0x100, "call 0x150"),
            insn(0x150, "dec A"),
            insn(0x151, "callNZ 0x150"),
            insn(0x150, "dec A"),
            insn(0x151, "callNZ 0x150"),
            insn(0x154, "ret "),
            insn(0x154, "ret "),
            insn(0x103, "nop"),
        ]);
        let graph = CallGraph::from_program(&p);
        let mut out = Vec::new();
        graph.render(&SymbolTable::default(), &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "0x100\n    0x150\n        0x150\n\n"
        );
    }
}
