//! The backend: instruction selection from HIR to x86-64 LIR, and textual
//! emission of the final assembly module.

pub mod emit;
pub mod lowlevel;
pub mod lowlevel_codegen;
