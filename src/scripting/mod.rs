//! Formula scripting: executor, inputs, shared library

mod executor;
mod library;

pub use executor::{ScriptError, ScriptExecutor, ScriptInputs, ScriptOutcome};
pub use library::{LibraryScript, ScriptLibrary};
