//! Capability registry.
//!
//! The exact namespace a script can see, assembled from the static
//! [`CAPABILITIES`] table. Nothing reaches a script unless it is listed here;
//! the host interpreter's globals are never exposed wholesale.

use mlua::{Lua, LuaSerdeExt, Table, Value};

use crate::analysis;
use crate::bridge::DataBridge;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityKind {
    Primitive,
    Library,
    Constant,
    /// Network-capable; exactly one entry has this kind.
    Bridge,
}

/// Where the binding comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilitySource {
    /// Interpreter base function of the same name.
    Base,
    /// Field of an interpreter library table, e.g. `table.unpack`.
    LibraryField(&'static str, &'static str),
    /// Interpreter standard library table.
    StdLibrary,
    /// [`crate::analysis`] toolkit.
    Analysis,
    /// The `null` sentinel.
    Null,
    /// [`DataBridge::fetch`].
    DataBridge,
}

#[derive(Clone, Copy, Debug)]
pub struct CapabilityDescriptor {
    pub name: &'static str,
    pub kind: CapabilityKind,
    pub summary: &'static str,
    pub source: CapabilitySource,
}

const fn cap(
    name: &'static str,
    kind: CapabilityKind,
    source: CapabilitySource,
    summary: &'static str,
) -> CapabilityDescriptor {
    CapabilityDescriptor {
        name,
        kind,
        summary,
        source,
    }
}

use CapabilityKind::{Bridge, Constant, Library, Primitive};
use CapabilitySource::{Analysis, Base, LibraryField, Null, StdLibrary};

/// Every binding visible to scripts.
pub const CAPABILITIES: &[CapabilityDescriptor] = &[
    cap("assert", Primitive, Base, "raise unless the condition holds"),
    cap("error", Primitive, Base, "raise an error"),
    cap("ipairs", Primitive, Base, "iterate a sequence"),
    cap("next", Primitive, Base, "next key of a table"),
    cap("pairs", Primitive, Base, "iterate a table"),
    cap("pcall", Primitive, Base, "call, catching errors"),
    cap("select", Primitive, Base, "pick from varargs"),
    cap("tonumber", Primitive, Base, "parse a number"),
    cap("tostring", Primitive, Base, "render a value"),
    cap("type", Primitive, Base, "type name of a value"),
    cap("unpack", Primitive, LibraryField("table", "unpack"), "spread a sequence"),
    cap("range", Primitive, Analysis, "integer sequence"),
    cap("len", Primitive, Analysis, "length of a string, table or Frame"),
    cap("sum", Primitive, Analysis, "sum of a sequence"),
    cap("min", Primitive, Analysis, "smallest item"),
    cap("max", Primitive, Analysis, "largest item"),
    cap("sorted", Primitive, Analysis, "sorted copy of a sequence"),
    cap("abs", Primitive, Analysis, "absolute value"),
    cap("round", Primitive, Analysis, "round half to even"),
    cap("map", Primitive, Analysis, "apply a function to each item"),
    cap("filter", Primitive, Analysis, "keep matching items"),
    cap("str", Primitive, Analysis, "string conversion"),
    cap("int", Primitive, Analysis, "integer conversion"),
    cap("float", Primitive, Analysis, "float conversion"),
    cap("bool", Primitive, Analysis, "truthiness"),
    cap("list", Primitive, Analysis, "array copy"),
    cap("dict", Primitive, Analysis, "shallow table copy"),
    cap("print", Primitive, Analysis, "write to the gateway log"),
    cap("null", Constant, Null, "missing-value sentinel"),
    cap("math", Library, StdLibrary, "math library"),
    cap("string", Library, StdLibrary, "string library without dump"),
    cap("table", Library, StdLibrary, "table library"),
    cap("utf8", Library, StdLibrary, "utf8 library"),
    cap("stats", Library, Analysis, "mean, median, variance, stdev"),
    cap("Frame", Library, Analysis, "tabular records"),
    cap("fetch", Bridge, CapabilitySource::DataBridge, "authenticated data API read"),
];

/// String library entries removed before exposure.
const STRING_DENIED: &[&str] = &["dump"];

/// A per-request namespace built inside one interpreter.
pub struct CapabilityRegistry {
    namespace: Table,
}

impl CapabilityRegistry {
    /// Build the namespace in `lua`, binding `fetch` to `bridge`.
    pub fn build(lua: &Lua, bridge: DataBridge) -> mlua::Result<Self> {
        let globals = lua.globals();
        let namespace = lua.create_table()?;
        for descriptor in CAPABILITIES {
            let value = match descriptor.source {
                Base => globals.raw_get::<Value>(descriptor.name)?,
                LibraryField(library, field) => globals.raw_get::<Table>(library)?.raw_get::<Value>(field)?,
                StdLibrary => {
                    let library: Table = globals.raw_get(descriptor.name)?;
                    if descriptor.name == "string" {
                        for denied in STRING_DENIED {
                            library.raw_set(*denied, Value::Nil)?;
                        }
                    }
                    Value::Table(library)
                }
                Analysis => match descriptor.name {
                    "stats" => Value::Table(analysis::stats_library(lua)?),
                    "Frame" => Value::Table(analysis::frame_class(lua)?),
                    name => Value::Function(analysis::builtin(lua, name)?),
                },
                Null => lua.null(),
                CapabilitySource::DataBridge => Value::Function(fetch_function(lua, bridge.clone())?),
            };
            if value.is_nil() {
                return Err(mlua::Error::runtime(format!(
                    "capability '{}' is unavailable in this interpreter",
                    descriptor.name
                )));
            }
            namespace.raw_set(descriptor.name, value)?;
        }
        Ok(Self { namespace })
    }

    /// Table used as the script's outer scope.
    pub fn namespace(&self) -> &Table {
        &self.namespace
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        CAPABILITIES.iter().map(|d| d.name)
    }
}

/// `fetch(relative_path, environment)`: JSON comes back as interpreter values,
/// bridge failures leave as external errors carrying [`crate::BridgeError`].
fn fetch_function(lua: &Lua, bridge: DataBridge) -> mlua::Result<mlua::Function> {
    lua.create_function(move |lua, (path, environment): (String, Option<String>)| {
        let environment = environment.unwrap_or_default();
        let data = bridge
            .fetch(&path, &environment)
            .map_err(mlua::Error::external)?;
        lua.to_value(&data)
    })
}
