//! Lua runtime host
//!
//! One `ScriptHost` owns one Lua state. Every entry into the state, whether
//! from a selector method, a telemetry event or the heartbeat, goes through
//! the same async mutex, so the script never runs re-entrantly.
//!
//! The host installs two module tables before the script runs:
//! - `panapi`: the `log(...)` helper, plus the selector entry points the
//!   script assigns (`initialize`, `selectpath`, `pathdown`, `refresh`,
//!   `close`, `periodic`)
//! - `stats`: telemetry entry points named after the events
//!
//! Entry points may also be defined as plain globals.

use std::path::Path as FsPath;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use mlua::{FromLuaMulti, Function, IntoLuaMulti, Lua, MultiValue, Table, Value};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use panpolicy_core::{ScriptConfig, ScriptError};

/// Module table holding the selector entry points and `log`
pub const PANAPI: &str = "panapi";
/// Module table holding the telemetry entry points
pub const STATS: &str = "stats";
/// Heartbeat entry point, called with the elapsed seconds since the last tick
pub const PERIODIC: &str = "periodic";

// ----------------------------------------------------------------------------
// Script Host
// ----------------------------------------------------------------------------

/// A loaded script and the lock serializing all entry into it
pub struct ScriptHost {
    name: String,
    lua: Arc<Mutex<Lua>>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
}

impl ScriptHost {
    /// Load and run a script given as source text
    pub fn from_source(name: impl Into<String>, source: &str) -> Result<Self, ScriptError> {
        let name = name.into();
        let load_error = |e: mlua::Error| ScriptError::Load {
            name: name.clone(),
            reason: e.to_string(),
        };

        let lua = Lua::new();
        install_modules(&lua, &name).map_err(load_error)?;
        lua.load(source)
            .set_name(name.as_str())
            .exec()
            .map_err(load_error)?;
        info!(script = %name, "loaded policy script");

        Ok(Self {
            name,
            lua: Arc::new(Mutex::new(lua)),
            heartbeat: StdMutex::new(None),
        })
    }

    /// Load and run a script file
    pub fn load_file(path: impl AsRef<FsPath>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| ScriptError::Load {
            name: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_source(path.display().to_string(), &source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire exclusive access to the Lua state
    pub async fn lock(&self) -> MutexGuard<'_, Lua> {
        self.lua.lock().await
    }

    /// Call `module.entry` (or the global `entry`) under the host lock
    pub async fn call<R: FromLuaMulti>(
        &self,
        module: &str,
        entry: &str,
        args: impl IntoLuaMulti,
    ) -> Result<R, ScriptError> {
        let lua = self.lock().await;
        invoke(&lua, module, entry, args)
    }

    /// Start calling `periodic(elapsed_seconds)` every `config.periodic_interval()`
    ///
    /// Replaces a running heartbeat. Returns `false` when there is no tokio
    /// runtime to run it on.
    pub fn spawn_heartbeat(&self, config: &ScriptConfig) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(script = %self.name, "no async runtime, heartbeat disabled");
            return false;
        };
        let interval = config.periodic_interval();
        let task = runtime.spawn(heartbeat(Arc::clone(&self.lua), self.name.clone(), interval));

        if let Some(previous) = self.heartbeat_slot().replace(task) {
            previous.abort();
        }
        debug!(script = %self.name, interval_ms = interval.as_millis() as u64, "heartbeat started");
        true
    }

    pub fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat_slot().take() {
            task.abort();
            debug!(script = %self.name, "heartbeat stopped");
        }
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat_slot()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn heartbeat_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl core::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("name", &self.name)
            .field("heartbeat", &self.is_heartbeat_running())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Entry Points
// ----------------------------------------------------------------------------

/// Look up `module.entry`, falling back to the global `entry`
pub fn entry_point(lua: &Lua, module: &str, entry: &str) -> mlua::Result<Option<Function>> {
    let globals = lua.globals();
    if let Value::Table(table) = globals.get::<Value>(module)? {
        if let Value::Function(f) = table.get::<Value>(entry)? {
            return Ok(Some(f));
        }
    }
    match globals.get::<Value>(entry)? {
        Value::Function(f) => Ok(Some(f)),
        _ => Ok(None),
    }
}

/// Call an entry point on an already locked state
pub fn invoke<R: FromLuaMulti>(
    lua: &Lua,
    module: &str,
    entry: &str,
    args: impl IntoLuaMulti,
) -> Result<R, ScriptError> {
    let function = entry_point(lua, module, entry)
        .map_err(|e| runtime_error(entry, e))?
        .ok_or_else(|| ScriptError::NotImplemented {
            entry: entry.to_string(),
        })?;
    function.call::<R>(args).map_err(|e| runtime_error(entry, e))
}

pub(crate) fn runtime_error(entry: &str, e: mlua::Error) -> ScriptError {
    ScriptError::Runtime {
        entry: entry.to_string(),
        reason: e.to_string(),
    }
}

fn install_modules(lua: &Lua, name: &str) -> mlua::Result<()> {
    let panapi = lua.create_table()?;
    let script = name.to_string();
    let log = lua.create_function(move |lua, args: MultiValue| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut parts = Vec::with_capacity(args.len());
        for arg in args {
            parts.push(tostring.call::<String>(arg)?);
        }
        info!(target: "panpolicy::script", script = %script, "{}", parts.join(" "));
        Ok(())
    })?;
    panapi.set("log", log)?;

    let stats = lua.create_table()?;
    register_module(lua, PANAPI, panapi)?;
    register_module(lua, STATS, stats)
}

/// Expose `table` as a global and to `require`
fn register_module(lua: &Lua, name: &str, table: Table) -> mlua::Result<()> {
    let globals = lua.globals();
    globals.set(name, table.clone())?;
    if let Value::Table(package) = globals.get::<Value>("package")? {
        if let Value::Table(loaded) = package.get::<Value>("loaded")? {
            loaded.set(name, table)?;
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Heartbeat
// ----------------------------------------------------------------------------

async fn heartbeat(lua: Arc<Mutex<Lua>>, script: String, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    let mut reported_missing = false;

    loop {
        ticker.tick().await;
        let lua = lua.lock().await;
        let elapsed = last.elapsed().as_secs_f64();
        match invoke::<()>(&lua, PANAPI, PERIODIC, elapsed) {
            Ok(()) => {}
            Err(ScriptError::NotImplemented { .. }) => {
                if !reported_missing {
                    info!(script = %script, "script defines no periodic, heartbeat is a no-op");
                    reported_missing = true;
                }
            }
            Err(e) => warn!(script = %script, error = %e, "periodic failed"),
        }
        last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_entry_point_is_not_implemented() {
        let host = ScriptHost::from_source("empty.lua", "").expect("Failed to load script");
        let lua = host.lua.try_lock().expect("Failed to lock");
        let err = invoke::<()>(&lua, PANAPI, "refresh", ()).unwrap_err();
        assert_eq!(
            err,
            ScriptError::NotImplemented {
                entry: "refresh".into()
            }
        );
        assert_eq!(err.to_string(), "function refresh not implemented in script");
    }

    #[test]
    fn test_entry_points_on_module_and_globals() {
        let host = ScriptHost::from_source(
            "entries.lua",
            r#"
            panapi.selectpath = function(remote) return "module " .. remote end
            function close(remote) return "global " .. remote end
            "#,
        )
        .expect("Failed to load script");
        let lua = host.lua.try_lock().unwrap();
        let from_module: String = invoke(&lua, PANAPI, "selectpath", "r").unwrap();
        let from_global: String = invoke(&lua, PANAPI, "close", "r").unwrap();
        assert_eq!(from_module, "module r");
        assert_eq!(from_global, "global r");
    }

    #[test]
    fn test_require_returns_panapi() {
        let host = ScriptHost::from_source(
            "require.lua",
            r#"
            local api = require("panapi")
            api.log("loaded", 1, true)
            same = api == panapi
            "#,
        )
        .expect("Failed to load script");
        let lua = host.lua.try_lock().unwrap();
        assert!(lua.globals().get::<bool>("same").unwrap());
    }

    #[test]
    fn test_syntax_error_is_load_error() {
        let err = ScriptHost::from_source("broken.lua", "function (").unwrap_err();
        assert!(matches!(err, ScriptError::Load { ref name, .. } if name == "broken.lua"));
    }

    #[test]
    fn test_runtime_error_is_contained() {
        let host = ScriptHost::from_source(
            "fails.lua",
            "function panapi.refresh() error('boom') end",
        )
        .unwrap();
        let lua = host.lua.try_lock().unwrap();
        let err = invoke::<()>(&lua, PANAPI, "refresh", ()).unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { ref reason, .. } if reason.contains("boom")));
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let err = ScriptHost::load_file("/nonexistent/policy.lua").unwrap_err();
        assert!(matches!(err, ScriptError::Load { .. }));
    }

    #[tokio::test]
    async fn test_heartbeat_calls_periodic_with_elapsed_seconds() {
        let host = ScriptHost::from_source(
            "tick.lua",
            r#"
            ticks = 0
            total = 0
            function panapi.periodic(elapsed)
                ticks = ticks + 1
                total = total + elapsed
            end
            "#,
        )
        .unwrap();
        assert!(host.spawn_heartbeat(&ScriptConfig::testing()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        host.stop_heartbeat();
        assert!(!host.is_heartbeat_running());

        let lua = host.lock().await;
        let ticks: i64 = lua.globals().get("ticks").unwrap();
        let total: f64 = lua.globals().get("total").unwrap();
        assert!(ticks >= 1, "periodic never ran");
        assert!(total > 0.0);
    }

    #[tokio::test]
    async fn test_heartbeat_without_periodic_keeps_running() {
        let host = ScriptHost::from_source("quiet.lua", "").unwrap();
        assert!(host.spawn_heartbeat(&ScriptConfig::testing()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(host.is_heartbeat_running());
    }

    #[test]
    fn test_heartbeat_needs_runtime() {
        let host = ScriptHost::from_source("quiet.lua", "").unwrap();
        assert!(!host.spawn_heartbeat(&ScriptConfig::testing()));
    }
}
