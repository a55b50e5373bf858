//! Embedded JavaScript runtime for route modules, built on `boa_engine`.
pub mod compiler;
pub mod context;
pub mod pool;
pub mod runtime;
pub mod transpile;

pub use compiler::ModuleCompiler;
pub use context::{Invocation, ScriptState};
pub use pool::{PooledRuntime, RuntimePool};
pub use runtime::{CompiledModule, EntrySet, RuntimeOptions, SCRIPT_TIMEOUT, ScriptRuntime};
