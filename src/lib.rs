//! Eva bytecode virtual machine
//!
//! This crate compiles a small Lisp-like language ("Eva") to stack-machine
//! bytecode and executes it. The pipeline is deliberately conventional:
//!
//! ```text
//! source → parser (s-expressions) → scope analysis → compiler → VM
//! ```
//!
//! The interesting parts live in four tightly coupled modules:
//!
//! - `scope`: classifies every binding as a global, a stack-resident local,
//!   or a heap cell (for closure capture), before any code is emitted.
//! - `compiler`: a single-pass code generator driven by the scope analysis,
//!   producing one code object per function with a constant pool and patched
//!   forward jumps.
//! - `vm`: an instruction-pointer-driven interpreter over a fixed operand
//!   stack and a separate call-frame stack, with first-class functions,
//!   closures, and classes with single inheritance.
//! - `gc`: a mark-and-sweep collector rooted in the operand stack, the
//!   globals table, and the compiler's constant set.
//!
//! The quickest way in is [`exec`]:
//!
//! ```
//! use evavm::vm::Vm;
//!
//! let mut vm = Vm::new();
//! let result = vm.exec("(+ 1 2)").unwrap();
//! assert_eq!(result.as_number(), Some(3.0));
//! ```
//!
//! ## Execution model
//!
//! Programs are wrapped in `(begin …)` before parsing, so a "program" is any
//! whitespace-separated sequence of expressions. Errors are fatal: a failed
//! execution returns `Err` and leaves the VM unusable (create a fresh
//! [`vm::Vm`] per program, as the tests do).

use std::fmt;

/// Operand stack capacity. Pushing beyond this is a fatal [`Error::StackOverflow`].
pub const STACK_LIMIT: usize = 512;

/// Allocated-byte threshold after which a runtime allocation triggers a GC cycle.
pub const GC_THRESHOLD: usize = 1024;

/// Maximum parsing depth to prevent stack overflow from deeply nested input.
pub const MAX_PARSE_DEPTH: usize = 64;

/// Error type for the whole pipeline.
///
/// All errors are fatal: there are no retries and no recovery. Each variant
/// renders as a single-line message, which is what the REPL and the driver
/// print before discarding the VM.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid source syntax (from the s-expression parser).
    ParseError(String),
    /// Unresolved symbol at compile time, or an unknown global index at runtime.
    ReferenceError(String),
    /// A wrong operand tag reached an arithmetic, comparison, call, or property op.
    TypeError(String),
    /// Push at operand-stack capacity.
    StackOverflow,
    /// Pop or peek with an empty stack; the payload names the operation.
    EmptyStack(&'static str),
    /// The dispatcher hit a byte that is not an opcode.
    UnknownOpcode(u8),
    /// Property lookup walked the class chain without finding the name.
    UnresolvedProperty { class: String, prop: String },
    /// A local or cell index was out of range for the current frame.
    IndexOutOfRange(String),
    /// More than 256 constants, locals, cells, or globals; the payload names the table.
    CapacityExceeded(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ParseError(msg) => write!(f, "ParseError: {msg}"),
            Error::ReferenceError(name) => {
                write!(f, "ReferenceError: {name} is not defined")
            }
            Error::TypeError(msg) => write!(f, "TypeError: {msg}"),
            Error::StackOverflow => write!(f, "StackOverflow: operand stack limit reached"),
            Error::EmptyStack(op) => write!(f, "EmptyStack: {op} on empty stack"),
            Error::UnknownOpcode(byte) => write!(f, "UnknownOpcode: {byte:#04x}"),
            Error::UnresolvedProperty { class, prop } => {
                write!(f, "UnresolvedProperty: {prop} in class {class}")
            }
            Error::IndexOutOfRange(msg) => write!(f, "IndexOutOfRange: {msg}"),
            Error::CapacityExceeded(what) => {
                write!(f, "CapacityExceeded: more than 256 {what}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub mod ast;
pub mod compiler;
pub mod disassembler;
pub mod gc;
pub mod global;
pub mod heap;
pub mod opcode;
pub mod parser;
pub mod scope;
pub mod value;
pub mod vm;

/// Parse, compile, and run a program in a fresh VM, returning the final value.
///
/// Convenience for one-shot execution; callers that need to inspect heap
/// objects in the result (strings, instances) should keep the [`vm::Vm`]
/// around and use [`vm::Vm::exec`] directly.
pub fn exec(program: &str) -> Result<value::Value, Error> {
    vm::Vm::new().exec(program)
}
