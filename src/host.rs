//! Execution host.
//!
//! One interpreter per request. The script runs in a fresh, empty scope table
//! whose only outer namespace is the capability registry, and its result is
//! read back from the scope's own `output` binding.

use mlua::{Lua, LuaOptions, StdLib, Value};
use thiserror::Error;

use crate::capability::CapabilityRegistry;
use crate::error::BridgeError;

/// Binding a script assigns to return its result.
pub const OUTPUT_BINDING: &str = "output";

const CHUNK_NAME: &str = "=script";

/// What the script left in its output binding.
#[derive(Debug)]
pub enum ExecutionResult {
    Bound(Value),
    /// The script completed without assigning `output` (or assigned `nil`).
    Absent,
}

/// Any failure raised while evaluating a script.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionFault {
    pub message: String,
    /// Full diagnostic text, including the interpreter traceback and, for
    /// upstream API failures, the response status, headers and body.
    pub trace: String,
    /// Set when the fault originated in the data bridge or token provider.
    pub bridge: Option<BridgeError>,
}

impl ExecutionFault {
    pub fn from_lua(err: mlua::Error) -> Self {
        let root = root_cause(&err);
        let bridge = match root {
            mlua::Error::ExternalError(inner) => inner.downcast_ref::<BridgeError>().cloned(),
            _ => None,
        };
        let message = match (&bridge, root) {
            (Some(bridge), _) => bridge.to_string(),
            (None, mlua::Error::RuntimeError(msg)) => first_line(msg),
            (None, mlua::Error::SyntaxError { message, .. }) => first_line(message),
            (None, other) => first_line(&other.to_string()),
        };
        let mut trace = err.to_string();
        if let Some(BridgeError::Upstream(upstream)) = &bridge {
            trace.push('\n');
            trace.push_str(&upstream.diagnostics());
        }
        Self {
            message,
            trace,
            bridge,
        }
    }

    fn setup(err: mlua::Error) -> Self {
        Self {
            message: format!("interpreter setup failed: {err}"),
            trace: err.to_string(),
            bridge: None,
        }
    }
}

fn root_cause(err: &mlua::Error) -> &mlua::Error {
    match err {
        mlua::Error::CallbackError { cause, .. } => root_cause(cause),
        mlua::Error::WithContext { cause, .. } => root_cause(cause),
        other => other,
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}

/// A fresh interpreter with only the pure standard libraries loaded.
pub struct ExecutionHost {
    lua: Lua,
}

impl ExecutionHost {
    pub fn new() -> Result<Self, ExecutionFault> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
            LuaOptions::new(),
        )
        .map_err(ExecutionFault::setup)?;
        Ok(Self { lua })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Run `script` against `registry` and extract the output binding.
    ///
    /// No time, memory or call-depth limit is applied.
    pub fn execute(
        &self,
        script: &str,
        registry: &CapabilityRegistry,
    ) -> Result<ExecutionResult, ExecutionFault> {
        let scope = self.lua.create_table().map_err(ExecutionFault::setup)?;
        let outer = self.lua.create_table().map_err(ExecutionFault::setup)?;
        outer
            .raw_set("__index", registry.namespace().clone())
            .map_err(ExecutionFault::setup)?;
        scope.set_metatable(Some(outer));

        self.lua
            .load(script)
            .set_name(CHUNK_NAME)
            .set_environment(scope.clone())
            .exec()
            .map_err(ExecutionFault::from_lua)?;

        let output: Value = scope
            .raw_get(OUTPUT_BINDING)
            .map_err(ExecutionFault::from_lua)?;
        Ok(match output {
            Value::Nil => ExecutionResult::Absent,
            value => ExecutionResult::Bound(value),
        })
    }
}
