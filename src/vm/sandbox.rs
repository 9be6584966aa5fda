//! Per-plugin sandboxes and the evaluation-context bootstrap.
//!
//! The engine context is bootstrapped once with timer shims (microtask
//! backed), a `console` routed into the host's logger, and a helper that
//! clones the standard globals into a fresh object. Each plugin then gets a
//! sandbox: its own global object and its own `process` with the env from
//! the plugin's template. Mutations inside a plugin land on those objects,
//! never on the shared context or the host.

use rquickjs::{Ctx, Function, Object, Value};

use crate::options::SandboxTemplate;

/// Script evaluated once per engine context before any plugin code.
const BOOTSTRAP_JS: &str = r#"
(function (global) {
  "use strict";
  if (global.__plugman_ready) { return; }
  global.__plugman_ready = true;

  var nextTimer = 1;
  var cancelled = Object.create(null);
  function schedule(callback, args) {
    var id = nextTimer++;
    Promise.resolve().then(function () {
      var skip = cancelled[id];
      delete cancelled[id];
      if (!skip) { callback.apply(null, args); }
    });
    return id;
  }
  global.setTimeout = function (callback) {
    return schedule(callback, Array.prototype.slice.call(arguments, 2));
  };
  global.setInterval = global.setTimeout;
  global.setImmediate = function (callback) {
    return schedule(callback, Array.prototype.slice.call(arguments, 1));
  };
  global.clearTimeout = function (id) { cancelled[id] = true; };
  global.clearInterval = global.clearTimeout;
  global.clearImmediate = global.clearTimeout;

  function write(level) {
    return function () {
      var parts = [];
      for (var i = 0; i < arguments.length; i++) {
        var value = arguments[i];
        if (typeof value === "string") {
          parts.push(value);
        } else {
          try { parts.push(JSON.stringify(value)); }
          catch (e) { parts.push(String(value)); }
        }
      }
      __plugman_log(level, parts.join(" "));
    };
  }
  global.console = {
    log: write("info"),
    info: write("info"),
    warn: write("warn"),
    error: write("error"),
    debug: write("debug"),
    trace: write("debug")
  };

  global.__plugman_make_global = function () {
    var fresh = {};
    var names = Object.getOwnPropertyNames(global);
    for (var i = 0; i < names.length; i++) {
      fresh[names[i]] = global[names[i]];
    }
    fresh.global = fresh;
    fresh.globalThis = fresh;
    return fresh;
  };

  global.__plugman_invoke = function (target, name, args) {
    var fn = target[name];
    if (typeof fn !== "function") {
      throw new TypeError("export '" + name + "' is not a function");
    }
    return fn.apply(target, args);
  };
})(globalThis);
"#;

/// Install the logging hook and the bootstrap script into a fresh context.
pub fn install_bootstrap(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let log_fn = Function::new(ctx.clone(), |level: String, message: String| {
        match level.as_str() {
            "error" | "warn" => log::warn!("[plugin] {}", message),
            "debug" => log::debug!("[plugin] {}", message),
            _ => log::info!("[plugin] {}", message),
        }
    })?;
    ctx.globals().set("__plugman_log", log_fn)?;
    ctx.eval::<(), _>(BOOTSTRAP_JS)
}

/// Build a plugin sandbox: `{ global, process }`.
///
/// The global object shallow-copies the context's standard globals, so the
/// plugin can read them but its writes stay private. The template's extra
/// globals and env are merged on top; an unset env copies the host's.
pub fn build_sandbox<'js>(
    ctx: &Ctx<'js>,
    template: &SandboxTemplate,
    host_env: &[(String, String)],
    cwd: &str,
) -> rquickjs::Result<Object<'js>> {
    let make: Function = ctx.globals().get("__plugman_make_global")?;
    let global_obj: Object = make.call(())?;

    if let Some(extra) = &template.globals {
        for (key, value) in extra {
            global_obj.set(key.as_str(), json_to_js(ctx, value)?)?;
        }
    }

    let env_obj = Object::new(ctx.clone())?;
    match &template.env {
        Some(env) => {
            for (key, value) in env {
                env_obj.set(key.as_str(), value.as_str())?;
            }
        }
        None => {
            for (key, value) in host_env {
                env_obj.set(key.as_str(), value.as_str())?;
            }
        }
    }

    let process = Object::new(ctx.clone())?;
    process.set("env", env_obj)?;
    process.set("platform", node_platform())?;
    process.set("argv", json_to_js(ctx, &serde_json::json!([]))?)?;
    process.set("cwd", cwd)?;

    global_obj.set("process", process.clone())?;

    let sandbox = Object::new(ctx.clone())?;
    sandbox.set("global", global_obj)?;
    sandbox.set("process", process)?;
    Ok(sandbox)
}

/// The platform name plugins expect from `process.platform`.
pub fn node_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

/// Convert a JSON value into an engine value.
pub fn json_to_js<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    // serde_json::Value always serialises.
    let text = serde_json::to_string(value).expect("JSON value serialises");
    ctx.json_parse(text)
}

/// Snapshot an engine value as JSON. Values JSON cannot express (functions,
/// `undefined`) become `null`.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    match ctx.json_stringify(value)? {
        Some(text) => {
            let text = text.to_string()?;
            Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::Null))
        }
        None => Ok(serde_json::Value::Null),
    }
}
