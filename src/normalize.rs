//! Result normalizer.
//!
//! Converts a script's output value into a JSON tree. Never fails: shapes
//! that have no JSON form are resolved through the [`FallbackPolicy`].

use mlua::{AnyUserData, Lua, LuaSerdeExt, ObjectLike, Table, Value};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use std::ffi::c_void;

use crate::analysis::TYPENAME_KEY;

/// Nesting depth past which values fall back.
pub const MAX_DEPTH: usize = 64;

const DICT_CONVERSION: &str = "to_dict";
const LIST_CONVERSION: &str = "to_list";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// The value's string representation.
    Stringify,
    Null,
    /// `"<function>"`, `"<userdata>"`, ...
    TypeName,
}

/// Fallback strategy per nearest field name, with a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackPolicy {
    pub default: FallbackStrategy,
    pub fields: BTreeMap<String, FallbackStrategy>,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("data".to_string(), FallbackStrategy::Stringify);
        Self {
            default: FallbackStrategy::TypeName,
            fields,
        }
    }
}

impl FallbackPolicy {
    pub fn strategy_for(&self, field: Option<&str>) -> FallbackStrategy {
        field
            .and_then(|f| self.fields.get(f).copied())
            .unwrap_or(self.default)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Normalizer {
    policy: FallbackPolicy,
}

impl Normalizer {
    pub fn new(policy: FallbackPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn normalize(&self, lua: &Lua, value: &Value) -> JsonValue {
        let mut walk = Walk {
            lua,
            policy: &self.policy,
            active: HashSet::new(),
        };
        walk.value(value, None, 0)
    }
}

struct Walk<'a> {
    lua: &'a Lua,
    policy: &'a FallbackPolicy,
    /// Tables on the current path, for cycle detection.
    active: HashSet<*const c_void>,
}

impl Walk<'_> {
    fn value(&mut self, value: &Value, field: Option<&str>, depth: usize) -> JsonValue {
        if depth > MAX_DEPTH {
            return self.fallback(value, field, "nesting too deep");
        }
        match value {
            Value::Nil => JsonValue::Null,
            Value::LightUserData(ud) if ud.0.is_null() => JsonValue::Null,
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Number(n) => JsonValue::from(*n),
            Value::String(s) => JsonValue::String(s.to_string_lossy().to_string()),
            Value::Table(t) => self.table(t, field, depth),
            Value::UserData(ud) => self.userdata(ud, field, depth),
            other => self.fallback(other, field, "unrepresentable type"),
        }
    }

    fn table(&mut self, t: &Table, field: Option<&str>, depth: usize) -> JsonValue {
        let ptr = t.to_pointer();
        if !self.active.insert(ptr) {
            return self.fallback(&Value::Table(t.clone()), field, "cycle");
        }
        let out = self.table_inner(t, field, depth);
        self.active.remove(&ptr);
        out
    }

    fn table_inner(&mut self, t: &Table, field: Option<&str>, depth: usize) -> JsonValue {
        let meta = t.metatable();
        let is_array = meta.as_ref().map(Table::to_pointer)
            == Some(self.lua.array_metatable().to_pointer());

        if let Some(meta) = meta.as_ref().filter(|_| !is_array) {
            for conversion in [DICT_CONVERSION, LIST_CONVERSION] {
                if let Ok(Value::Function(f)) = t.get::<Value>(conversion) {
                    let result = f.call::<Value>(t.clone());
                    return self.converted(result, Value::Table(t.clone()), field, depth);
                }
            }
            if let Ok(Value::String(name)) = meta.raw_get::<Value>(TYPENAME_KEY) {
                return JsonValue::String(name.to_string_lossy().to_string());
            }
        }

        let pairs: Vec<(Value, Value)> = match t.pairs::<Value, Value>().collect() {
            Ok(pairs) => pairs,
            Err(_) => return self.fallback(&Value::Table(t.clone()), field, "unreadable table"),
        };
        if is_array || is_sequence(&pairs) {
            let len = t.raw_len();
            let mut items = Vec::with_capacity(len);
            for i in 1..=len {
                let item = t.raw_get::<Value>(i).unwrap_or(Value::Nil);
                items.push(self.value(&item, field, depth + 1));
            }
            return JsonValue::Array(items);
        }

        let mut object = JsonMap::new();
        for (key, item) in &pairs {
            let key = match key {
                Value::String(s) => s.to_string_lossy().to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Boolean(b) => b.to_string(),
                other => format!("<{}>", other.type_name()),
            };
            let normalized = self.value(item, Some(&key), depth + 1);
            object.insert(key, normalized);
        }
        JsonValue::Object(object)
    }

    fn userdata(&mut self, ud: &AnyUserData, field: Option<&str>, depth: usize) -> JsonValue {
        for conversion in [DICT_CONVERSION, LIST_CONVERSION] {
            if let Ok(Value::Function(_)) = ud.get::<Value>(conversion) {
                let result = ud.call_method::<Value>(conversion, ());
                return self.converted(result, Value::UserData(ud.clone()), field, depth);
            }
        }
        self.fallback(&Value::UserData(ud.clone()), field, "opaque userdata")
    }

    fn converted(
        &mut self,
        result: mlua::Result<Value>,
        source: Value,
        field: Option<&str>,
        depth: usize,
    ) -> JsonValue {
        match result {
            Ok(converted) => self.value(&converted, field, depth + 1),
            Err(err) => {
                log::warn!("normalizer conversion failed: {}", first_line(&err.to_string()));
                self.fallback(&source, field, "conversion failed")
            }
        }
    }

    fn fallback(&self, value: &Value, field: Option<&str>, reason: &str) -> JsonValue {
        let strategy = self.policy.strategy_for(field);
        log::warn!(
            "normalizer fallback ({}) for {} at field {:?}: {:?}",
            reason,
            value.type_name(),
            field,
            strategy
        );
        match strategy {
            FallbackStrategy::Null => JsonValue::Null,
            FallbackStrategy::TypeName => type_name(value),
            FallbackStrategy::Stringify => match value.to_string() {
                Ok(text) => JsonValue::String(text),
                Err(_) => type_name(value),
            },
        }
    }
}

fn type_name(value: &Value) -> JsonValue {
    JsonValue::String(format!("<{}>", value.type_name()))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Keys are exactly the integers `1..=n`, n > 0.
fn is_sequence(pairs: &[(Value, Value)]) -> bool {
    if pairs.is_empty() {
        return false;
    }
    let n = pairs.len() as i64;
    pairs
        .iter()
        .all(|(k, _)| matches!(k, Value::Integer(i) if (1..=n).contains(i)))
}
