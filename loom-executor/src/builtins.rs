//! Host primitives installed into every sandbox.
//!
//! Globals: `json`, `date`, `clone`, `uri`, `console` (and `print` as an
//! alias of `console.log`). Modules reachable through `require`: `crypto`
//! and `url`.

use std::cell::RefCell;
use std::rc::Rc;

use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use loom_core::{ConsoleEntry, ConsoleLevel};
use mlua::{Lua, Table, Value, Variadic};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

use crate::convert::{display, json_to_lua, lua_to_json};

/// Entries past this many are dropped from the capture.
pub const MAX_CONSOLE_ENTRIES: usize = 1_000;

/// Characters left unescaped by `uri.encode`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Base functions a handler must not reach.
const REMOVED_GLOBALS: &[&str] = &["dofile", "loadfile", "load", "loadstring", "collectgarbage"];

/// Console output captured from one invocation.
pub type ConsoleCapture = Rc<RefCell<Vec<ConsoleEntry>>>;

/// Built-in modules that `require` may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinModule {
    Crypto,
    Url,
}

impl BuiltinModule {
    /// Looks up a built-in by its `require` name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "crypto" => Some(Self::Crypto),
            "url" => Some(Self::Url),
            _ => None,
        }
    }

    /// Builds the module table inside `lua`.
    ///
    /// # Errors
    /// Fails if the allocator refuses the table or its functions.
    pub fn load(self, lua: &Lua) -> mlua::Result<Table> {
        match self {
            Self::Crypto => crypto_module(lua),
            Self::Url => url_module(lua),
        }
    }
}

/// Strips unsafe base functions and installs the host primitives.
///
/// # Errors
/// Fails if the allocator refuses any of the new values.
pub fn install(lua: &Lua, console: &ConsoleCapture) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(*name, Value::Nil)?;
    }
    if let Ok(string) = globals.get::<Table>("string") {
        string.raw_set("dump", Value::Nil)?;
    }

    let console_table = console_module(lua, console)?;
    globals.raw_set("print", console_table.get::<Value>("log")?)?;
    globals.raw_set("console", console_table)?;
    globals.raw_set("json", json_module(lua)?)?;
    globals.raw_set("date", date_module(lua)?)?;
    globals.raw_set("uri", uri_module(lua)?)?;
    globals.raw_set(
        "clone",
        lua.create_function(|lua, value: Value| json_to_lua(lua, &lua_to_json(&value)?))?,
    )?;
    Ok(())
}

fn console_module(lua: &Lua, console: &ConsoleCapture) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for (name, level) in [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Info),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ] {
        let sink = Rc::clone(console);
        let f = lua.create_function(move |_, args: Variadic<Value>| {
            let mut entries = sink.borrow_mut();
            if entries.len() < MAX_CONSOLE_ENTRIES {
                let message = args.iter().map(display).collect::<Vec<_>>().join(" ");
                entries.push(ConsoleEntry::new(level, message));
            }
            Ok(())
        })?;
        table.raw_set(name, f)?;
    }
    Ok(table)
}

fn json_module(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set(
        "encode",
        lua.create_function(|_, value: Value| Ok(lua_to_json(&value)?.to_string()))?,
    )?;
    table.raw_set(
        "decode",
        lua.create_function(|lua, text: mlua::String| {
            let parsed: serde_json::Value = serde_json::from_slice(&text.as_bytes())
                .map_err(|e| mlua::Error::runtime(format!("invalid JSON: {e}")))?;
            json_to_lua(lua, &parsed)
        })?,
    )?;
    Ok(table)
}

fn date_module(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set("now", lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?)?;
    table.raw_set(
        "iso",
        lua.create_function(|_, ()| Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)))?,
    )?;
    Ok(table)
}

fn uri_module(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set(
        "encode",
        lua.create_function(|_, text: String| {
            Ok(utf8_percent_encode(&text, URI_COMPONENT).to_string())
        })?,
    )?;
    table.raw_set(
        "decode",
        lua.create_function(|_, text: String| {
            percent_decode_str(&text)
                .decode_utf8()
                .map(std::borrow::Cow::into_owned)
                .map_err(|e| mlua::Error::runtime(format!("invalid percent-encoding: {e}")))
        })?,
    )?;
    Ok(table)
}

fn crypto_module(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set(
        "sha256",
        lua.create_function(|_, data: mlua::String| Ok(hex::encode(Sha256::digest(&*data.as_bytes()))))?,
    )?;
    table.raw_set(
        "hmac_sha256",
        lua.create_function(|_, (key, data): (mlua::String, mlua::String)| {
            let mut mac = Hmac::<Sha256>::new_from_slice(&key.as_bytes())
                .map_err(|e| mlua::Error::runtime(format!("invalid hmac key: {e}")))?;
            mac.update(&data.as_bytes());
            Ok(hex::encode(mac.finalize().into_bytes()))
        })?,
    )?;
    table.raw_set(
        "uuid",
        lua.create_function(|_, ()| Ok(uuid::Uuid::new_v4().to_string()))?,
    )?;
    table.raw_set(
        "base64_encode",
        lua.create_function(|_, data: mlua::String| {
            Ok(base64::engine::general_purpose::STANDARD.encode(&*data.as_bytes()))
        })?,
    )?;
    table.raw_set(
        "base64_decode",
        lua.create_function(|lua, text: String| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| mlua::Error::runtime(format!("invalid base64: {e}")))?;
            lua.create_string(bytes)
        })?,
    )?;
    Ok(table)
}

fn url_module(lua: &Lua) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.raw_set(
        "parse",
        lua.create_function(|lua, text: String| {
            let parsed = url::Url::parse(&text)
                .map_err(|e| mlua::Error::runtime(format!("invalid url '{text}': {e}")))?;
            let out = lua.create_table()?;
            out.raw_set("href", parsed.as_str())?;
            out.raw_set("scheme", parsed.scheme())?;
            out.raw_set("host", parsed.host_str())?;
            out.raw_set("port", parsed.port_or_known_default())?;
            out.raw_set("path", parsed.path())?;
            out.raw_set("query", parsed.query())?;
            out.raw_set("fragment", parsed.fragment())?;
            let params = lua.create_table()?;
            for (k, v) in parsed.query_pairs() {
                params.raw_set(&*k, &*v)?;
            }
            out.raw_set("params", params)?;
            Ok(out)
        })?,
    )?;
    Ok(table)
}
