pub mod ast;
pub mod compile;
pub mod cte;
pub mod dialect;
pub mod error;
pub mod filter;
pub mod functions;
pub mod graph;
pub mod lex;
pub mod parser;
pub mod schema;
pub mod select;
pub mod sql;
pub mod state;
pub mod support;
pub mod translate;

pub use compile::{compile, CompileOptions, CompiledFormula, Compiler};
pub use dialect::Dialect;
pub use error::{Error, Result};
pub use select::{QueryOptions, RecordQuery};
pub use state::{QueryState, StateView};
pub use support::{field_supports_generated, supports_generated};
pub use translate::Mode;

#[cfg(test)]
mod tests;
