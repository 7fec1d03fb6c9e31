pub mod analyzer;
pub mod branch;
pub mod callgraph;
pub mod dis;
pub mod replay;
pub mod syms;
pub mod tracer;
