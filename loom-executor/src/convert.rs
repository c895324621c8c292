//! Conversions between Lua values and `serde_json::Value`.

use mlua::{Lua, Table, Value};

/// Tables nested deeper than this are rejected, which also catches cycles.
const MAX_DEPTH: usize = 64;

/// Converts a Lua value to JSON.
///
/// A table whose keys are exactly `1..=n` becomes an array; any other table
/// becomes an object with stringified keys. An empty table is `{}`.
///
/// # Errors
/// Fails on functions, userdata, threads, non-finite numbers, or nesting
/// deeper than 64 levels.
pub fn lua_to_json(value: &Value) -> mlua::Result<serde_json::Value> {
    to_json(value, 0)
}

fn to_json(value: &Value, depth: usize) -> mlua::Result<serde_json::Value> {
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or_else(|| mlua::Error::runtime(format!("cannot encode non-finite number {n}")))?,
        Value::String(s) => serde_json::Value::String(String::from(s.to_string_lossy())),
        Value::Table(t) => table_to_json(t, depth)?,
        other => {
            return Err(mlua::Error::runtime(format!(
                "cannot encode a value of type {}",
                other.type_name()
            )))
        }
    })
}

fn table_to_json(table: &Table, depth: usize) -> mlua::Result<serde_json::Value> {
    if depth >= MAX_DEPTH {
        return Err(mlua::Error::runtime("table nesting too deep (or cyclic) to encode"));
    }
    let pairs = table.pairs::<Value, Value>().collect::<mlua::Result<Vec<_>>>()?;
    let len = table.raw_len();
    if len > 0 && pairs.len() == len {
        let mut items = Vec::with_capacity(len);
        for i in 1..=len {
            items.push(to_json(&table.raw_get::<Value>(i)?, depth + 1)?);
        }
        return Ok(serde_json::Value::Array(items));
    }
    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        let key = match key {
            Value::String(s) => String::from(s.to_string_lossy()),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            other => {
                return Err(mlua::Error::runtime(format!(
                    "cannot encode a table key of type {}",
                    other.type_name()
                )))
            }
        };
        map.insert(key, to_json(&value, depth + 1)?);
    }
    Ok(serde_json::Value::Object(map))
}

/// Converts JSON into a fresh Lua value. `null` becomes `nil`.
///
/// # Errors
/// Fails only if the Lua allocator refuses the new tables or strings.
pub fn json_to_lua(lua: &Lua, value: &serde_json::Value) -> mlua::Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map_or(Value::Nil, Value::Number),
        },
        serde_json::Value::String(s) => Value::String(lua.create_string(s)?),
        serde_json::Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            Value::Table(table)
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                table.raw_set(k.as_str(), json_to_lua(lua, v)?)?;
            }
            Value::Table(table)
        }
    })
}

/// Renders a value the way `console.log` shows it: strings verbatim,
/// tables as JSON, everything else through its Lua spelling.
#[must_use]
pub fn display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_owned(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => String::from(s.to_string_lossy()),
        Value::Table(_) => match lua_to_json(value) {
            Ok(json) => json.to_string(),
            Err(_) => "table".to_owned(),
        },
        other => other.type_name().to_owned(),
    }
}
