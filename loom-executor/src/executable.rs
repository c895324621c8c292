//! Compilation of handler source into an [`Executable`].

use std::sync::Arc;

use mlua::{Lua, LuaOptions, StdLib};

use crate::error::ExecutionError;

/// Handler source that is known to parse.
///
/// Compilation is only a syntax check: the chunk is loaded again inside
/// each fresh sandbox, so nothing compiled here is shared between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    source: Arc<str>,
    chunk_name: Arc<str>,
}

impl Executable {
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Chunk name used in Lua error messages and tracebacks.
    #[must_use]
    pub fn chunk_name(&self) -> &str {
        &self.chunk_name
    }
}

/// Syntax-checks `source` and wraps it for execution.
///
/// `name` appears in error messages as the chunk name.
///
/// # Errors
/// Returns [`ExecutionError::Compile`] if the source does not parse.
pub fn compile(source: &str, name: &str) -> Result<Executable, ExecutionError> {
    let lua = Lua::new_with(StdLib::NONE, LuaOptions::new())
        .map_err(|e| ExecutionError::Internal(format!("failed to create Lua state: {e}")))?;
    let chunk_name = format!("={name}");
    lua.load(source)
        .set_name(chunk_name.clone())
        .into_function()
        .map_err(|e| ExecutionError::Compile { message: compile_message(&e) })?;
    Ok(Executable {
        source: Arc::from(source),
        chunk_name: Arc::from(chunk_name),
    })
}

fn compile_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
