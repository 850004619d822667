//! Sable: a just-in-time compiler for a small statically-typed,
//! indentation-structured scripting language.
//!
//! Source text runs through a lexer with off-side-rule framing, a
//! recursive-descent parser, a semantic analyzer that assigns data
//! types and resolves names, overloads, generics and member access, and
//! a backend that lowers the typed AST onto Cranelift, generates
//! runtime support routines on demand, links the module and executes
//! native code inside a recoverable panic frame.
//!
//! ```no_run
//! use sable::Vm;
//!
//! let mut vm = Vm::new();
//! vm.load_str("log(1 + 2 * 3)\n");
//! assert!(vm.compile());
//! vm.run();
//! ```

mod analysis;
mod ast;
mod backend;
mod error;
mod intern;
mod lexer;
mod parser;
mod runtime;
mod token;
mod types;
mod vm;

pub use error::{Diagnostic, ErrorCallback};
pub use runtime::RuntimePanic;
pub use token::Span;
pub use vm::{PanicCallback, Vm};
