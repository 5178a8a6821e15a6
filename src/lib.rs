pub mod assemble;
pub mod ast;
pub mod bytecode;
pub mod diagnostic;
pub mod driver;
pub mod fix;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod rewrite;
pub mod vm;

pub use driver::{DEFAULT_MAX_ITERATIONS, DivergenceError, IterateError, Step, iterate};
pub use fix::{Decorator, FixError, Fixed, UsageError, fix, fix_function, transform};
