//! Analysis toolkit exposed to scripts.
//!
//! Data-analysis builtins (`range`, `len`, `sum`, `sorted`, ...), the
//! `stats` library and the `Frame` tabular type. Everything here is pure
//! computation over interpreter values; nothing touches the process, the
//! filesystem or the network.

use mlua::{
    AnyUserData, Function, IntoLua, Lua, LuaSerdeExt, MetaMethod, Table, UserData,
    UserDataMethods, Value, Variadic,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::cmp::Ordering;

/// Names of the builtins produced by [`builtin`].
pub const BUILTINS: &[&str] = &[
    "range", "len", "sum", "min", "max", "sorted", "abs", "round", "map", "filter", "str", "int",
    "float", "bool", "list", "dict", "print",
];

/// Metatable key naming a class descriptor table.
pub const TYPENAME_KEY: &str = "__typename";

const FRAME_TYPENAME: &str = "Frame";
const HEAD_DEFAULT: usize = 5;

/// Build the builtin function named `name`.
pub fn builtin(lua: &Lua, name: &str) -> mlua::Result<Function> {
    match name {
        "range" => lua.create_function(range),
        "len" => lua.create_function(|_, value: Value| len(&value)),
        "sum" => lua.create_function(sum),
        "min" => lua.create_function(|_, args: Variadic<Value>| extreme(args, Ordering::Less, "min")),
        "max" => lua.create_function(|_, args: Variadic<Value>| {
            extreme(args, Ordering::Greater, "max")
        }),
        "sorted" => lua.create_function(sorted),
        "abs" => lua.create_function(|_, value: Value| abs(&value)),
        "round" => lua.create_function(round),
        "map" => lua.create_function(|lua, (f, items): (Function, Value)| {
            let mapped = sequence(&items)?
                .into_iter()
                .map(|item| f.call::<Value>(item))
                .collect::<mlua::Result<Vec<_>>>()?;
            array(lua, mapped)
        }),
        "filter" => lua.create_function(|lua, (f, items): (Option<Function>, Value)| {
            let mut kept = Vec::new();
            for item in sequence(&items)? {
                let keep = match &f {
                    Some(f) => truthy(&f.call::<Value>(item.clone())?),
                    None => truthy(&item),
                };
                if keep {
                    kept.push(item);
                }
            }
            array(lua, kept)
        }),
        "str" => lua.create_function(|lua, value: Value| lua.create_string(to_display(&value)?)),
        "int" => lua.create_function(|_, value: Value| to_int(&value)),
        "float" => lua.create_function(|_, value: Value| to_float(&value)),
        "bool" => lua.create_function(|_, value: Value| Ok(truthy(&value))),
        "list" => lua.create_function(|lua, value: Value| list(lua, &value)),
        "dict" => lua.create_function(|lua, value: Option<Table>| {
            let copy = lua.create_table()?;
            if let Some(source) = value {
                for pair in source.pairs::<Value, Value>() {
                    let (k, v) = pair?;
                    copy.raw_set(k, v)?;
                }
            }
            Ok(copy)
        }),
        "print" => lua.create_function(|_, args: Variadic<Value>| {
            let line = args
                .iter()
                .map(to_display)
                .collect::<mlua::Result<Vec<_>>>()?
                .join(" ");
            log::info!(target: "script", "{}", line);
            Ok(())
        }),
        other => Err(mlua::Error::runtime(format!("unknown builtin '{other}'"))),
    }
}

/// `stats.mean`, `stats.median`, `stats.variance`, `stats.stdev`.
///
/// Inputs are sequences of numbers; `null` entries are skipped.
pub fn stats_library(lua: &Lua) -> mlua::Result<Table> {
    let stats = lua.create_table()?;
    stats.set(
        "mean",
        lua.create_function(|_, data: Value| {
            let xs = samples(&data, 1, "mean")?;
            Ok(mean(&xs))
        })?,
    )?;
    stats.set(
        "median",
        lua.create_function(|_, data: Value| {
            let mut xs = samples(&data, 1, "median")?;
            xs.sort_by(f64::total_cmp);
            let mid = xs.len() / 2;
            Ok(if xs.len() % 2 == 1 {
                xs[mid]
            } else {
                (xs[mid - 1] + xs[mid]) / 2.0
            })
        })?,
    )?;
    stats.set(
        "variance",
        lua.create_function(|_, data: Value| Ok(variance(&samples(&data, 2, "variance")?)))?,
    )?;
    stats.set(
        "stdev",
        lua.create_function(|_, data: Value| {
            Ok(variance(&samples(&data, 2, "stdev")?).sqrt())
        })?,
    )?;
    Ok(stats)
}

/// The `Frame` class table: callable, and carrying `new`.
pub fn frame_class(lua: &Lua) -> mlua::Result<Table> {
    let class = lua.create_table()?;
    class.set(
        "new",
        lua.create_function(|lua, source: Value| Frame::from_lua_value(lua, source))?,
    )?;
    let meta = lua.create_table()?;
    meta.set(TYPENAME_KEY, FRAME_TYPENAME)?;
    meta.set(
        "__call",
        lua.create_function(|lua, (_, source): (Table, Value)| Frame::from_lua_value(lua, source))?,
    )?;
    class.set_metatable(Some(meta));
    Ok(class)
}

/// Table marked as an array, so empty sequences still serialize as `[]`.
pub fn array<T: IntoLua>(lua: &Lua, items: impl IntoIterator<Item = T>) -> mlua::Result<Table> {
    let table = lua.create_sequence_from(items)?;
    table.set_metatable(Some(lua.array_metatable()));
    Ok(table)
}

/// Truthiness over interpreter values: nil, false, zero, empty strings
/// and empty tables are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Nil | Value::Boolean(false) => false,
        Value::LightUserData(ud) => !ud.0.is_null(),
        Value::Integer(i) => *i != 0,
        Value::Number(n) => *n != 0.0,
        Value::String(s) => !s.as_bytes().is_empty(),
        Value::Table(t) => t.pairs::<Value, Value>().next().is_some(),
        Value::UserData(ud) => match ud.borrow::<Frame>() {
            Ok(frame) => !frame.rows.is_empty(),
            Err(_) => true,
        },
        _ => true,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    fn from_lua(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(Self::Int(*i)),
            Value::Number(n) => Some(Self::Float(*n)),
            _ => None,
        }
    }

    fn from_json(value: &JsonValue) -> Option<Self> {
        let JsonValue::Number(n) = value else {
            return None;
        };
        match n.as_i64() {
            Some(i) => Some(Self::Int(i)),
            None => n.as_f64().map(Self::Float),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    fn plus(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => match a.checked_add(b) {
                Some(sum) => Self::Int(sum),
                None => Self::Float(a as f64 + b as f64),
            },
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn into_lua(self) -> Value {
        match self {
            Self::Int(i) => Value::Integer(i),
            Self::Float(f) => Value::Number(f),
        }
    }

    fn into_json(self) -> JsonValue {
        match self {
            Self::Int(i) => JsonValue::from(i),
            Self::Float(f) => JsonValue::from(f),
        }
    }
}

fn sequence(value: &Value) -> mlua::Result<Vec<Value>> {
    match value {
        Value::Table(t) => t.sequence_values::<Value>().collect(),
        other => Err(mlua::Error::runtime(format!(
            "expected a table, got {}",
            other.type_name()
        ))),
    }
}

fn range(lua: &Lua, (first, stop, step): (i64, Option<i64>, Option<i64>)) -> mlua::Result<Table> {
    let (start, stop) = match stop {
        Some(stop) => (first, stop),
        None => (0, first),
    };
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(mlua::Error::runtime("range() step must not be zero"));
    }
    let mut values = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        values.push(i);
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    array(lua, values)
}

fn len(value: &Value) -> mlua::Result<i64> {
    let n = match value {
        Value::String(s) => match s.to_str() {
            Ok(text) => text.chars().count(),
            Err(_) => s.as_bytes().len(),
        },
        Value::Table(t) => match t.raw_len() {
            0 => t.pairs::<Value, Value>().count(),
            n => n,
        },
        Value::UserData(ud) => frame_ref(ud)?.rows.len(),
        other => {
            return Err(mlua::Error::runtime(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(n as i64)
}

fn sum(_: &Lua, (items, start): (Value, Option<Value>)) -> mlua::Result<Value> {
    let mut total = match start {
        Some(start) => Numeric::from_lua(&start)
            .ok_or_else(|| mlua::Error::runtime("sum() start must be a number"))?,
        None => Numeric::Int(0),
    };
    for item in sequence(&items)? {
        let n = Numeric::from_lua(&item).ok_or_else(|| {
            mlua::Error::runtime(format!(
                "unsupported operand for sum(): {}",
                item.type_name()
            ))
        })?;
        total = total.plus(n);
    }
    Ok(total.into_lua())
}

fn compare(a: &Value, b: &Value) -> mlua::Result<Ordering> {
    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Ok(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Ok(x.as_bytes()[..].cmp(&y.as_bytes()[..])),
        _ => match (Numeric::from_lua(a), Numeric::from_lua(b)) {
            (Some(x), Some(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .ok_or_else(|| mlua::Error::runtime("cannot order NaN")),
            _ => Err(mlua::Error::runtime(format!(
                "cannot compare {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn extreme(args: Variadic<Value>, want: Ordering, name: &str) -> mlua::Result<Value> {
    let candidates = match args.as_slice() {
        [single @ Value::Table(_)] => sequence(single)?,
        _ => args.to_vec(),
    };
    let mut best: Option<Value> = None;
    for candidate in candidates {
        best = match best {
            Some(current) if compare(&candidate, &current)? != want => Some(current),
            _ => Some(candidate),
        };
    }
    best.ok_or_else(|| mlua::Error::runtime(format!("{name}() arg is an empty sequence")))
}

fn sorted(
    lua: &Lua,
    (items, key, reverse): (Value, Option<Function>, Option<bool>),
) -> mlua::Result<Table> {
    let values = sequence(&items)?;
    let keys = match &key {
        Some(f) => values
            .iter()
            .map(|v| f.call::<Value>(v.clone()))
            .collect::<mlua::Result<Vec<_>>>()?,
        None => values.clone(),
    };
    let reverse = reverse.unwrap_or(false);
    let mut order: Vec<usize> = (0..values.len()).collect();
    let mut failure = None;
    order.sort_by(|&a, &b| match compare(&keys[a], &keys[b]) {
        Ok(ordering) if reverse => ordering.reverse(),
        Ok(ordering) => ordering,
        Err(err) => {
            failure.get_or_insert(err);
            Ordering::Equal
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    array(lua, order.into_iter().map(|i| values[i].clone()))
}

fn abs(value: &Value) -> mlua::Result<Value> {
    match value {
        Value::Integer(i) => i
            .checked_abs()
            .map(Value::Integer)
            .ok_or_else(|| mlua::Error::runtime("integer overflow in abs()")),
        Value::Number(n) => Ok(Value::Number(n.abs())),
        other => Err(mlua::Error::runtime(format!(
            "bad operand type for abs(): {}",
            other.type_name()
        ))),
    }
}

/// Round half to even.
fn round(_: &Lua, (value, digits): (Value, Option<i32>)) -> mlua::Result<Value> {
    match (value, digits) {
        (Value::Integer(i), _) => Ok(Value::Integer(i)),
        (Value::Number(n), None) => {
            let r = n.round_ties_even();
            if r.is_finite() && r >= i64::MIN as f64 && r <= i64::MAX as f64 {
                Ok(Value::Integer(r as i64))
            } else {
                Err(mlua::Error::runtime(format!("cannot round {n} to an integer")))
            }
        }
        (Value::Number(n), Some(digits)) => {
            let scale = 10f64.powi(digits);
            Ok(Value::Number((n * scale).round_ties_even() / scale))
        }
        (other, _) => Err(mlua::Error::runtime(format!(
            "type {} doesn't define round()",
            other.type_name()
        ))),
    }
}

fn to_display(value: &Value) -> mlua::Result<String> {
    match value {
        Value::LightUserData(ud) if ud.0.is_null() => Ok("null".to_string()),
        Value::String(s) => Ok(s.to_string_lossy().to_string()),
        other => other.to_string(),
    }
}

fn to_int(value: &Value) -> mlua::Result<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) if n.is_finite() && n.trunc() >= i64::MIN as f64 && n.trunc() <= i64::MAX as f64 => {
            Ok(n.trunc() as i64)
        }
        Value::Boolean(b) => Ok(i64::from(*b)),
        Value::String(s) => {
            let text = s.to_string_lossy().to_string();
            text.trim().parse::<i64>().map_err(|_| {
                mlua::Error::runtime(format!("invalid literal for int(): '{text}'"))
            })
        }
        other => Err(mlua::Error::runtime(format!(
            "int() argument must be a string or a number, not {}",
            other.type_name()
        ))),
    }
}

fn to_float(value: &Value) -> mlua::Result<f64> {
    match value {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) => Ok(*n),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let text = s.to_string_lossy().to_string();
            text.trim().parse::<f64>().map_err(|_| {
                mlua::Error::runtime(format!("could not convert string to float: '{text}'"))
            })
        }
        other => Err(mlua::Error::runtime(format!(
            "float() argument must be a string or a number, not {}",
            other.type_name()
        ))),
    }
}

fn list(lua: &Lua, value: &Value) -> mlua::Result<Table> {
    match value {
        Value::Nil => array(lua, Vec::<Value>::new()),
        Value::String(s) => {
            let text = s.to_string_lossy().to_string();
            array(lua, text.chars().map(|c| c.to_string()))
        }
        Value::UserData(ud) => {
            let records = frame_ref(ud)?.to_records();
            match lua.to_value(&records)? {
                Value::Table(t) => Ok(t),
                _ => array(lua, Vec::<Value>::new()),
            }
        }
        other => array(lua, sequence(other)?),
    }
}

fn samples(data: &Value, minimum: usize, name: &str) -> mlua::Result<Vec<f64>> {
    let mut xs = Vec::new();
    for item in sequence(data)? {
        match &item {
            Value::LightUserData(ud) if ud.0.is_null() => continue,
            _ => {}
        }
        let n = Numeric::from_lua(&item).ok_or_else(|| {
            mlua::Error::runtime(format!("{name}() expects numbers, got {}", item.type_name()))
        })?;
        // NaN counts as missing, like null.
        let x = n.as_f64();
        if !x.is_nan() {
            xs.push(x);
        }
    }
    if xs.len() < minimum {
        return Err(mlua::Error::runtime(format!(
            "{name}() requires at least {minimum} data point(s)"
        )));
    }
    Ok(xs)
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (n - 1 denominator).
fn variance(xs: &[f64]) -> f64 {
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

fn frame_ref(ud: &AnyUserData) -> mlua::Result<mlua::UserDataRef<Frame>> {
    ud.borrow::<Frame>()
        .map_err(|_| mlua::Error::runtime("expected a Frame"))
}

/// Row-oriented table of JSON records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<JsonMap<String, JsonValue>>,
}

impl Frame {
    /// Accepts an array of records, an OData envelope `{"value": [...]}`,
    /// or a column-oriented object `{"col": [...]}`.
    pub fn from_json(source: JsonValue) -> Result<Self, String> {
        let records = match source {
            JsonValue::Array(items) => items,
            JsonValue::Object(mut map) => match map.remove("value") {
                Some(JsonValue::Array(items)) if map.is_empty() || !is_columnar(&map) => items,
                Some(value) => {
                    map.insert("value".to_string(), value);
                    return Self::from_columns(map);
                }
                None => return Self::from_columns(map),
            },
            other => return Err(format!("cannot build a Frame from {}", json_type(&other))),
        };
        let mut rows = Vec::with_capacity(records.len());
        for (i, record) in records.into_iter().enumerate() {
            match record {
                JsonValue::Object(row) => rows.push(row),
                other => {
                    return Err(format!(
                        "Frame record {} is {}, expected an object",
                        i + 1,
                        json_type(&other)
                    ))
                }
            }
        }
        Ok(Self::from_rows(rows))
    }

    fn from_columns(map: JsonMap<String, JsonValue>) -> Result<Self, String> {
        let mut height = None;
        for (name, column) in &map {
            let n = column
                .as_array()
                .ok_or_else(|| format!("Frame column '{name}' is not an array"))?
                .len();
            match height {
                Some(h) if h != n => return Err("Frame columns have different lengths".to_string()),
                _ => height = Some(n),
            }
        }
        let mut rows = vec![JsonMap::new(); height.unwrap_or(0)];
        for (name, column) in &map {
            if let Some(values) = column.as_array() {
                for (row, value) in rows.iter_mut().zip(values) {
                    row.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(Self {
            columns: map.keys().cloned().collect(),
            rows,
        })
    }

    fn from_rows(rows: Vec<JsonMap<String, JsonValue>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    fn from_lua_value(lua: &Lua, source: Value) -> mlua::Result<Self> {
        if let Value::UserData(ud) = &source {
            return Ok(frame_ref(ud)?.clone());
        }
        let json: JsonValue = lua.from_value(source)?;
        Self::from_json(json).map_err(mlua::Error::runtime)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Vec<JsonValue> {
        self.rows
            .iter()
            .map(|row| row.get(name).cloned().unwrap_or(JsonValue::Null))
            .collect()
    }

    /// Column-oriented `{"col": [...]}`.
    pub fn to_columns(&self) -> JsonValue {
        let mut out = JsonMap::new();
        for name in &self.columns {
            out.insert(name.clone(), JsonValue::Array(self.column(name)));
        }
        JsonValue::Object(out)
    }

    /// Row-oriented `[{...}, ...]`.
    pub fn to_records(&self) -> JsonValue {
        JsonValue::Array(self.rows.iter().cloned().map(JsonValue::Object).collect())
    }

    fn with_rows(&self, rows: Vec<JsonMap<String, JsonValue>>) -> Self {
        Self {
            columns: self.columns.clone(),
            rows,
        }
    }

    fn require_column(&self, name: &str) -> mlua::Result<()> {
        if self.columns.iter().any(|c| c == name) {
            Ok(())
        } else {
            Err(mlua::Error::runtime(format!("Frame has no column '{name}'")))
        }
    }

    pub fn select(&self, names: &[String]) -> Result<Self, String> {
        if let Some(missing) = names.iter().find(|n| !self.columns.contains(n)) {
            return Err(format!("Frame has no column '{missing}'"));
        }
        let rows = self
            .rows
            .iter()
            .map(|row| {
                names
                    .iter()
                    .filter_map(|n| row.get(n).map(|v| (n.clone(), v.clone())))
                    .collect()
            })
            .collect();
        Ok(Self {
            columns: names.to_vec(),
            rows,
        })
    }

    pub fn sort_by(&self, name: &str, descending: bool) -> Self {
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            let ordering = json_order(
                a.get(name).unwrap_or(&JsonValue::Null),
                b.get(name).unwrap_or(&JsonValue::Null),
            );
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        self.with_rows(rows)
    }

    pub fn head(&self, n: usize) -> Self {
        self.with_rows(self.rows.iter().take(n).cloned().collect())
    }

    /// Sum of `value` per distinct `key`; null values are skipped.
    pub fn group_sum(&self, key: &str, value: &str) -> Result<JsonValue, String> {
        let mut groups: Vec<(String, Numeric)> = Vec::new();
        for row in &self.rows {
            let label = key_label(row.get(key).unwrap_or(&JsonValue::Null));
            let amount = match row.get(value) {
                None | Some(JsonValue::Null) => Numeric::Int(0),
                Some(v) => Numeric::from_json(v)
                    .ok_or_else(|| format!("column '{value}' holds a non-numeric value"))?,
            };
            match groups.iter_mut().find(|(l, _)| *l == label) {
                Some((_, total)) => *total = total.plus(amount),
                None => groups.push((label, amount)),
            }
        }
        Ok(JsonValue::Object(
            groups.into_iter().map(|(l, t)| (l, t.into_json())).collect(),
        ))
    }

    pub fn count_by(&self, key: &str) -> JsonValue {
        let mut counts: JsonMap<String, JsonValue> = JsonMap::new();
        for row in &self.rows {
            let label = key_label(row.get(key).unwrap_or(&JsonValue::Null));
            let next = counts.get(&label).and_then(JsonValue::as_u64).unwrap_or(0) + 1;
            counts.insert(label, JsonValue::from(next));
        }
        JsonValue::Object(counts)
    }

    fn numeric_column(&self, name: &str) -> Result<Vec<Numeric>, String> {
        self.rows
            .iter()
            .filter_map(|row| row.get(name))
            .filter(|v| !v.is_null())
            .map(|v| {
                Numeric::from_json(v).ok_or_else(|| format!("column '{name}' holds a non-numeric value"))
            })
            .collect()
    }

    pub fn sum(&self, name: &str) -> Result<JsonValue, String> {
        Ok(self
            .numeric_column(name)?
            .into_iter()
            .fold(Numeric::Int(0), Numeric::plus)
            .into_json())
    }

    pub fn mean(&self, name: &str) -> Result<Option<f64>, String> {
        let values = self.numeric_column(name)?;
        if values.is_empty() {
            return Ok(None);
        }
        let xs: Vec<f64> = values.into_iter().map(Numeric::as_f64).collect();
        Ok(Some(mean(&xs)))
    }
}

impl UserData for Frame {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("columns", |lua, this, ()| array(lua, this.columns.clone()));
        methods.add_method("column", |lua, this, name: String| {
            this.require_column(&name)?;
            lua.to_value(&JsonValue::Array(this.column(&name)))
        });
        methods.add_method("filter", |lua, this, predicate: Function| {
            let mut kept = Vec::new();
            for row in &this.rows {
                let record = lua.to_value(&JsonValue::Object(row.clone()))?;
                if truthy(&predicate.call::<Value>(record)?) {
                    kept.push(row.clone());
                }
            }
            Ok(this.with_rows(kept))
        });
        methods.add_method("select", |_, this, names: Variadic<String>| {
            this.select(&names).map_err(mlua::Error::runtime)
        });
        methods.add_method("sort_by", |_, this, (name, descending): (String, Option<bool>)| {
            this.require_column(&name)?;
            Ok(this.sort_by(&name, descending.unwrap_or(false)))
        });
        methods.add_method("head", |_, this, n: Option<usize>| {
            Ok(this.head(n.unwrap_or(HEAD_DEFAULT)))
        });
        methods.add_method("group_sum", |lua, this, (key, value): (String, String)| {
            this.require_column(&key)?;
            let sums = this.group_sum(&key, &value).map_err(mlua::Error::runtime)?;
            lua.to_value(&sums)
        });
        methods.add_method("count_by", |lua, this, key: String| {
            this.require_column(&key)?;
            lua.to_value(&this.count_by(&key))
        });
        methods.add_method("sum", |lua, this, name: String| {
            this.require_column(&name)?;
            lua.to_value(&this.sum(&name).map_err(mlua::Error::runtime)?)
        });
        methods.add_method("mean", |_, this, name: String| {
            this.require_column(&name)?;
            this.mean(&name).map_err(mlua::Error::runtime)
        });
        methods.add_method("to_dict", |lua, this, ()| lua.to_value(&this.to_columns()));
        methods.add_method("to_list", |lua, this, ()| lua.to_value(&this.to_records()));
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.rows.len()));
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!(
                "Frame(rows={}, columns=[{}])",
                this.rows.len(),
                this.columns.join(", ")
            ))
        });
    }
}

fn is_columnar(map: &JsonMap<String, JsonValue>) -> bool {
    map.values().all(JsonValue::is_array)
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn key_label(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Total order for sorting: numbers, then strings, then booleans, nulls last.
fn json_order(a: &JsonValue, b: &JsonValue) -> Ordering {
    fn rank(v: &JsonValue) -> u8 {
        match v {
            JsonValue::Number(_) => 0,
            JsonValue::String(_) => 1,
            JsonValue::Bool(_) => 2,
            JsonValue::Array(_) | JsonValue::Object(_) => 3,
            JsonValue::Null => 4,
        }
    }
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
