#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod building;
mod entry;
mod environment;
mod error;
mod evaluator;
mod graph;
mod grouped;
mod invalidation;
mod key;
mod outcome;
mod reverse_deps;
mod tracer;

pub use building::*;
pub use entry::*;
pub use environment::*;
pub use error::{EvalError, ProtocolError};
pub use evaluator::*;
pub use graph::*;
pub use grouped::*;
pub use invalidation::*;
pub use key::*;
pub use outcome::*;
pub use reverse_deps::*;
pub use tracer::*;
