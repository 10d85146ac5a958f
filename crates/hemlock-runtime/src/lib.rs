//! Hemlock runtime library.
//!
//! Linked into every compiled Hemlock program. Provides:
//! - The tagged [`Value`] with manual reference counting (`value`, `memory`)
//! - Arithmetic with numeric promotion (`arithmetic`)
//! - Strings, arrays, objects and byte buffers
//! - Conversions, type annotations and the type registry (`convert`, `types`)
//! - Exceptions and deferred calls (`exception`, `defer`)
//! - Function values and the calling convention (`call`, `method`)
//! - A work-stealing scheduler with tasks and channels
//! - Atomics, JSON, files and program state
//!
//! Each module exposes a Rust API returning [`RtResult`] and a C ABI of
//! `hml_*` symbols for generated code. ABI entry points raise failures into
//! the calling thread's innermost exception frame.

pub mod arithmetic;
pub mod array;
pub mod atomics;
pub mod buffer;
pub mod call;
pub mod channel;
pub mod config;
pub mod convert;
pub mod defer;
pub mod error;
pub mod exception;
pub mod format;
pub mod handle;
pub mod json;
pub mod memory;
pub mod method;
pub mod object;
pub mod pointer;
pub mod scheduler;
pub mod state;
pub mod string;
pub mod task;
mod tls;
pub mod types;
pub mod value;

pub use arithmetic::{BinaryOp, UnaryOp};
pub use call::{FunctionInfo, call_function};
pub use config::RuntimeConfig;
pub use error::{RtError, RtErrorKind, RtResult};
pub use exception::protect;
pub use scheduler::ThreadPool;
pub use types::{FieldDef, TypeDef, TypeExpr};
pub use value::{Owned, Value, ValueTag, values_equal};
