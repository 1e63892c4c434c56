/// JSON <-> Lua value conversion
///
/// Tables are built directly through the Lua API rather than by generating source,
/// so data can never be interpreted as code on the way in.

use anyhow::Result;
use mlua::Lua;
use serde_json::Value;
use std::ffi::c_void;

use crate::error::EngineError;

/// Deepest nesting accepted when reading a table back
const MAX_DEPTH: usize = 64;

/// Convert a JSON value into a Lua value owned by `lua`
///
/// Arrays become 1-based sequence tables, objects become keyed tables, null is nil.
pub fn json_to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => mlua::Value::Integer(i),
            None => mlua::Value::Number(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Object(obj) => {
            let table = lua.create_table_with_capacity(0, obj.len())?;
            for (key, val) in obj {
                table.raw_set(key.as_str(), json_to_lua(lua, val)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

/// Convert a Lua value to JSON, spending at most `max_bytes` of output
///
/// A table whose keys are exactly 1..n is an array; anything else is an object.
/// Functions, userdata and threads become null. A table reached again through
/// itself is rejected. Shared subtables are copied each time they are reached, and
/// every copy is charged against `max_bytes`, so the budget is exhausted with
/// `EngineError::ResourceLimit` long before the host builds an oversized tree.
pub fn lua_to_json(lua_value: mlua::Value, max_bytes: usize) -> Result<Value> {
    let mut converter = Converter {
        remaining: max_bytes,
        max_bytes,
        ancestors: Vec::new(),
    };
    converter.convert(lua_value)
}

struct Converter {
    remaining: usize,
    max_bytes: usize,
    /// Tables on the path from the root to the value being converted
    ancestors: Vec<*const c_void>,
}

impl Converter {
    /// Charge a lower bound of the serialized size of the next piece
    fn charge(&mut self, bytes: usize) -> Result<()> {
        match self.remaining.checked_sub(bytes) {
            Some(left) => {
                self.remaining = left;
                Ok(())
            }
            None => Err(EngineError::ResourceLimit(format!(
                "sandbox result exceeds limit of {} bytes",
                self.max_bytes
            ))
            .into()),
        }
    }

    fn convert(&mut self, lua_value: mlua::Value) -> Result<Value> {
        match lua_value {
            mlua::Value::Nil => {
                self.charge(4)?;
                Ok(Value::Null)
            }
            mlua::Value::Boolean(b) => {
                self.charge(4)?;
                Ok(Value::Bool(b))
            }
            mlua::Value::Integer(i) => {
                self.charge(1)?;
                Ok(Value::Number(serde_json::Number::from(i)))
            }
            mlua::Value::Number(f) => {
                self.charge(1)?;
                Ok(serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
            mlua::Value::String(s) => {
                let s_str = s.to_str().map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua string: {}", e))?;
                self.charge(s_str.len() + 2)?;
                Ok(Value::String(s_str.to_string()))
            }
            mlua::Value::Table(table) => {
                let pointer = table.to_pointer();
                if self.ancestors.contains(&pointer) {
                    return Err(anyhow::anyhow!("Lua table contains itself"));
                }
                if self.ancestors.len() >= MAX_DEPTH {
                    return Err(anyhow::anyhow!("Lua value nested deeper than {} levels", MAX_DEPTH));
                }
                self.charge(2)?;

                self.ancestors.push(pointer);
                let converted = self.convert_table(table);
                self.ancestors.pop();
                converted
            }
            _ => {
                self.charge(4)?;
                Ok(Value::Null)
            }
        }
    }

    fn convert_table(&mut self, table: mlua::Table) -> Result<Value> {
        // Check if it's an array or object
        let mut is_array = true;
        let mut max_index = 0;
        let mut count = 0;

        for pair in table.pairs::<mlua::Value, mlua::Value>() {
            let (key, _) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
            count += 1;

            match key {
                mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                _ => {
                    is_array = false;
                    break;
                }
            }
        }

        if is_array && count > 0 && count == max_index {
            let mut arr = Vec::with_capacity(max_index);
            for i in 1..=max_index {
                let val = table
                    .raw_get(i)
                    .map_err(|e| anyhow::anyhow!("Failed to get Lua table value: {}", e))?;
                arr.push(self.convert(val)?);
            }
            Ok(Value::Array(arr))
        } else {
            let mut obj = serde_json::Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, value) = pair.map_err(|e| anyhow::anyhow!("Failed to iterate Lua table: {}", e))?;
                let key_str = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in Lua key: {}", e))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue, // Skip unsupported key types
                };
                self.charge(key_str.len() + 3)?;
                let value = self.convert(value)?;
                obj.insert(key_str, value);
            }
            Ok(Value::Object(obj))
        }
    }
}
