//! The sandboxed module loader.
//!
//! CommonJS `require` implemented from scratch on an embedded QuickJS
//! context, with resolution routed through the dependency bindings the
//! version manager recorded at install time instead of a filesystem walk.
//! Each file is compiled as the strict-mode body of a function taking the
//! usual module parameters; each plugin's code sees its own global object
//! and `process` built from the plugin's sandbox template. All plugins share
//! one engine context, so strict mode is what keeps an undeclared assignment
//! from landing on the context's real global object.
//!
//! Resolution order for `require(spec)` from a file of plugin P:
//! 1. core-module names (through the host-modules table),
//! 2. static dependencies,
//! 3. relative and absolute paths,
//! 4. P's recorded dependency bindings (exact pinned versions),
//! 5. the host-modules table as a last resort,
//! 6. failure.

mod resolver;
mod sandbox;

pub use resolver::{CORE_MODULES, is_core_module};

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, warn};
use rquickjs::function::Args;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Object, Persistent, Value};

use crate::error::PluginError;
use crate::manifest::split_specifier;
use crate::options::{ProvidedModule, SandboxTemplate};
use crate::runtime::Runtime;
use resolver::{FileResolver, normalize};
use sandbox::{build_sandbox, install_bootstrap, js_to_json, json_to_js};

/// The parameters every module body is compiled with.
const MODULE_PARAMS: &str = "module, exports, require, __filename, __dirname, global, process, \
     Buffer, setTimeout, clearTimeout, setInterval, clearInterval, setImmediate, clearImmediate";

/// Loader-facing configuration, copied out of the manager options.
#[derive(Debug, Clone, Default)]
pub struct VmOptions {
    pub require_core_modules: bool,
    pub host_modules: BTreeMap<String, ProvidedModule>,
    pub static_dependencies: BTreeMap<String, ProvidedModule>,
}

/// One registered package root: a versioned copy or an active-view directory.
#[derive(Debug, Clone)]
struct PackageEntry {
    name: String,
    #[allow(dead_code)]
    version: String,
    /// Dependency bindings: name -> pinned version.
    bindings: BTreeMap<String, String>,
}

/// What a require request resolved to.
enum Request {
    /// A file on disk, owned by the package rooted at `owner`.
    File { path: PathBuf, owner: PathBuf },
    /// A host- or static-provided module, cached under `key`.
    Provided { key: String, module: ProvidedModule },
}

struct VmState {
    fs: FileResolver,
    sys: Arc<dyn Runtime>,
    options: VmOptions,
    plugins_root: PathBuf,
    cwd: PathBuf,
    host_env: Vec<(String, String)>,
    default_template: SandboxTemplate,
    templates: HashMap<String, SandboxTemplate>,
    /// Registered package roots.
    packages: HashMap<PathBuf, PackageEntry>,
    /// `(name, version)` -> versioned root.
    versioned_roots: HashMap<(String, String), PathBuf>,
    /// name -> active-view root.
    active_roots: HashMap<String, PathBuf>,
    /// Export cache, keyed by canonical absolute file path.
    cache: HashMap<PathBuf, Persistent<Value<'static>>>,
    /// Modules currently executing, for circular requires.
    loading: HashMap<PathBuf, Persistent<Object<'static>>>,
    /// Sandboxes, keyed by plugin name (shared sandbox under its own key).
    sandboxes: HashMap<String, Persistent<Object<'static>>>,
    /// Host/static provided module cache.
    provided: HashMap<String, Persistent<Value<'static>>>,
    /// Typed error behind the most recent loader-thrown exception.
    pending_error: Option<PluginError>,
}

/// Sandbox key for code not owned by any plugin (`run_script`, host source).
const SHARED_SANDBOX: &str = "<shared>";

pub struct PluginVm {
    rt: rquickjs::Runtime,
    context: Context,
    state: Rc<RefCell<VmState>>,
    plugins_root: PathBuf,
    cwd: PathBuf,
}

impl PluginVm {
    pub fn new(
        sys: Arc<dyn Runtime>,
        options: VmOptions,
        default_template: SandboxTemplate,
        plugins_root: PathBuf,
        cwd: PathBuf,
    ) -> Result<Self, PluginError> {
        let rt = rquickjs::Runtime::new().map_err(engine_error)?;
        let context = Context::full(&rt).map_err(engine_error)?;
        context
            .with(|ctx| install_bootstrap(&ctx))
            .map_err(engine_error)?;

        let plugins_root = sys.canonicalize(&plugins_root).unwrap_or(plugins_root);
        let host_env = sys.env_vars();
        let state = VmState {
            fs: FileResolver::new(Arc::clone(&sys)),
            sys,
            options,
            plugins_root: plugins_root.clone(),
            cwd: cwd.clone(),
            host_env,
            default_template,
            templates: HashMap::new(),
            packages: HashMap::new(),
            versioned_roots: HashMap::new(),
            active_roots: HashMap::new(),
            cache: HashMap::new(),
            loading: HashMap::new(),
            sandboxes: HashMap::new(),
            provided: HashMap::new(),
            pending_error: None,
        };

        Ok(PluginVm {
            rt,
            context,
            state: Rc::new(RefCell::new(state)),
            plugins_root,
            cwd,
        })
    }

    /// Register (or re-register) a package root with its dependency bindings.
    pub fn register_package(
        &self,
        name: &str,
        version: &str,
        root: &Path,
        bindings: BTreeMap<String, String>,
        active: bool,
    ) {
        let mut st = self.state.borrow_mut();
        let root = st.sys.canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        debug!("Registering {}@{} at {:?} (active: {})", name, version, root, active);

        st.packages.insert(
            root.clone(),
            PackageEntry {
                name: name.to_string(),
                version: version.to_string(),
                bindings,
            },
        );
        if active {
            st.active_roots.insert(name.to_string(), root);
        } else {
            st.versioned_roots
                .insert((name.to_string(), version.to_string()), root);
        }
    }

    /// Forget a versioned copy that was garbage-collected.
    pub fn forget_version(&self, name: &str, version: &str) {
        let root = self
            .state
            .borrow_mut()
            .versioned_roots
            .remove(&(name.to_string(), version.to_string()));
        if let Some(root) = root {
            self.state.borrow_mut().packages.remove(&root);
            self.invalidate_under(&root);
        }
    }

    /// Forget an uninstalled plugin's active root.
    pub fn remove_active(&self, name: &str) {
        let root = self.state.borrow_mut().active_roots.remove(name);
        if let Some(root) = root {
            self.state.borrow_mut().packages.remove(&root);
            self.invalidate_under(&root);
        }
    }

    /// Drop every cached export whose origin lies under `root`.
    pub fn invalidate_under(&self, root: &Path) {
        let mut st = self.state.borrow_mut();
        st.cache.retain(|path, _| !path.starts_with(root));
        st.loading.retain(|path, _| !path.starts_with(root));
    }

    /// Drop cached exports of every root belonging to `name`.
    pub fn invalidate_plugin(&self, name: &str) {
        let roots: Vec<PathBuf> = {
            let st = self.state.borrow();
            st.active_roots
                .get(name)
                .cloned()
                .into_iter()
                .chain(
                    st.versioned_roots
                        .iter()
                        .filter(|((n, _), _)| n == name)
                        .map(|(_, root)| root.clone()),
                )
                .collect()
        };
        for root in roots {
            debug!("Invalidating cached exports under {:?}", root);
            self.invalidate_under(&root);
        }
    }

    /// Install a sandbox template for a plugin; the next load rebuilds the
    /// sandbox and its modules.
    pub fn set_template(&self, name: &str, template: Option<SandboxTemplate>) {
        {
            let mut st = self.state.borrow_mut();
            match template {
                Some(t) => {
                    st.templates.insert(name.to_string(), t);
                }
                None => {
                    st.templates.remove(name);
                }
            }
            st.sandboxes.remove(name);
        }
        self.invalidate_plugin(name);
    }

    pub fn get_template(&self, name: &str) -> Option<SandboxTemplate> {
        self.state.borrow().templates.get(name).cloned()
    }

    /// Synchronous `require` against the active view; returns a JSON
    /// snapshot of the module's exports.
    pub fn require(&self, spec: &str) -> Result<serde_json::Value, PluginError> {
        self.state.borrow_mut().pending_error = None;
        let result = self.context.with(|ctx| {
            let outcome =
                require_value(&self.state, &ctx, &self.plugins_root, &self.cwd, spec);
            match outcome.catch(&ctx) {
                Ok(value) => js_to_json(&ctx, value)
                    .map_err(|e| execution_error(spec, &e.to_string())),
                Err(caught) => Err(self.map_caught(spec, caught)),
            }
        });
        self.pump_jobs();
        result
    }

    /// Call a named function exported by a plugin, with JSON arguments.
    pub fn call_export(
        &self,
        spec: &str,
        export: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, PluginError> {
        self.state.borrow_mut().pending_error = None;
        let result = self.context.with(|ctx| {
            let outcome = (|| -> rquickjs::Result<Value<'_>> {
                let exports =
                    require_value(&self.state, &ctx, &self.plugins_root, &self.cwd, spec)?;
                let invoke: Function = ctx.globals().get("__plugman_invoke")?;
                let js_args = json_to_js(&ctx, &serde_json::Value::Array(args.to_vec()))?;
                invoke.call((exports, export, js_args))
            })();
            match outcome.catch(&ctx) {
                Ok(value) => js_to_json(&ctx, value)
                    .map_err(|e| execution_error(spec, &e.to_string())),
                Err(caught) => Err(self.map_caught(spec, caught)),
            }
        });
        self.pump_jobs();
        result
    }

    /// Compile `code` as a nameless module in the shared sandbox, with a
    /// `require` that resolves against the active view. Returns the module's
    /// exports as JSON.
    pub fn run_script(&self, code: &str) -> Result<serde_json::Value, PluginError> {
        self.state.borrow_mut().pending_error = None;
        let result = self.context.with(|ctx| {
            let outcome = eval_module_source(
                &self.state,
                &ctx,
                "<script>",
                code,
                &self.plugins_root,
                &self.cwd,
            );
            match outcome.catch(&ctx) {
                Ok(value) => js_to_json(&ctx, value)
                    .map_err(|e| execution_error("<script>", &e.to_string())),
                Err(caught) => Err(self.map_caught("<script>", caught)),
            }
        });
        self.pump_jobs();
        result
    }

    /// Drain engine jobs queued by the timer shims and promises.
    fn pump_jobs(&self) {
        loop {
            match self.rt.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => {
                    warn!("A queued plugin job threw; continuing with the next");
                }
            }
        }
    }

    /// Turn a caught engine exception into the typed error behind it, when
    /// the loader itself raised it.
    fn map_caught(&self, spec: &str, caught: CaughtError<'_>) -> PluginError {
        let message = caught.to_string();
        let pending = self.state.borrow_mut().pending_error.take();
        match pending {
            Some(typed) if message.contains(&typed.to_string()) => typed,
            _ => execution_error(spec, &message),
        }
    }
}

impl Drop for PluginVm {
    fn drop(&mut self) {
        // Saved engine values must be released while the context is still
        // alive; the require closures keep the state alive past this point.
        let mut st = self.state.borrow_mut();
        st.cache.clear();
        st.loading.clear();
        st.sandboxes.clear();
        st.provided.clear();
    }
}

fn engine_error(e: rquickjs::Error) -> PluginError {
    PluginError::ExecutionError {
        context: "engine".to_string(),
        message: e.to_string(),
    }
}

fn execution_error(context: &str, message: &str) -> PluginError {
    PluginError::ExecutionError {
        context: context.to_string(),
        message: message.to_string(),
    }
}

/// Resolve and load one require request.
fn require_value<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    owner_root: &Path,
    from_dir: &Path,
    spec: &str,
) -> rquickjs::Result<Value<'js>> {
    match resolve_request(state, owner_root, from_dir, spec) {
        Ok(Request::File { path, owner }) => load_file(state, ctx, &owner, &path),
        Ok(Request::Provided { key, module }) => load_provided(state, ctx, &key, &module),
        Err(err) => throw_typed(state, ctx, err),
    }
}

/// The resolution algorithm; see the module docs for the order.
fn resolve_request(
    state: &Rc<RefCell<VmState>>,
    owner_root: &Path,
    from_dir: &Path,
    spec: &str,
) -> Result<Request, PluginError> {
    let st = state.borrow();
    let not_found = || PluginError::ModuleNotFound {
        request: spec.to_string(),
        from: from_dir.display().to_string(),
    };

    // 1. Core modules. When disabled, a core name is still fair game for
    //    the later steps (an npm package may share it).
    if st.options.require_core_modules && is_core_module(spec) {
        let bare = spec.strip_prefix("node:").unwrap_or(spec);
        return match st.options.host_modules.get(bare) {
            Some(module) => Ok(Request::Provided {
                key: format!("core:{}", bare),
                module: module.clone(),
            }),
            None => Err(not_found()),
        };
    }

    // 2. Static dependencies.
    if let Some(module) = st.options.static_dependencies.get(spec) {
        return Ok(Request::Provided {
            key: format!("static:{}", spec),
            module: module.clone(),
        });
    }

    // 3. Paths.
    if spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/') {
        let base = if Path::new(spec).is_absolute() {
            normalize(Path::new(spec))
        } else {
            normalize(&from_dir.join(spec))
        };
        return match st.fs.resolve(&base) {
            Some(found) => Ok(Request::File {
                path: st.fs.canonical(&found),
                owner: owner_root.to_path_buf(),
            }),
            None => Err(not_found()),
        };
    }

    // 4. The owner's dependency bindings, or the active view for code
    //    running outside any plugin.
    let (head, rest) = split_specifier(spec);
    let dep_root = if owner_root == st.plugins_root {
        st.active_roots.get(head).cloned()
    } else {
        st.packages
            .get(owner_root)
            .and_then(|entry| entry.bindings.get(head))
            .and_then(|version| {
                st.versioned_roots
                    .get(&(head.to_string(), version.clone()))
                    .cloned()
            })
    };

    if let Some(dep_root) = dep_root {
        let found = match rest {
            Some(rest) => st.fs.resolve(&normalize(&dep_root.join(rest))),
            None => st.fs.resolve_as_dir(&dep_root),
        };
        return match found {
            Some(found) => Ok(Request::File {
                path: st.fs.canonical(&found),
                owner: dep_root,
            }),
            None => Err(not_found()),
        };
    }

    // 5. Host-provided modules as a last resort.
    if let Some(module) = st.options.host_modules.get(spec) {
        return Ok(Request::Provided {
            key: format!("host:{}", spec),
            module: module.clone(),
        });
    }

    Err(not_found())
}

/// Load a resolved file, honouring the export cache and circular requires.
fn load_file<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    owner_root: &Path,
    path: &Path,
) -> rquickjs::Result<Value<'js>> {
    // Cache and in-progress checks; a module being loaded hands out its
    // current exports (the CommonJS circular-require contract).
    if let Some(cached) = state.borrow().cache.get(path).cloned() {
        return cached.restore(ctx);
    }
    if let Some(in_progress) = state.borrow().loading.get(path).cloned() {
        let module: Object = in_progress.restore(ctx)?;
        return module.get("exports");
    }

    let read = {
        let st = state.borrow();
        st.sys.read_to_string(path)
    };
    let source = match read {
        Ok(source) => source,
        Err(e) => {
            return throw_typed(
                state,
                ctx,
                PluginError::io(path.to_path_buf(), std::io::Error::other(e.to_string())),
            );
        }
    };

    if path.extension().is_some_and(|ext| ext == "json") {
        let value: Value = ctx.json_parse(source)?;
        state
            .borrow_mut()
            .cache
            .insert(path.to_path_buf(), Persistent::save(ctx, value.clone()));
        return Ok(value);
    }

    debug!("Loading module {:?}", path);
    let module = Object::new(ctx.clone())?;
    let exports = Object::new(ctx.clone())?;
    module.set("exports", exports)?;
    module.set("id", path.display().to_string())?;
    module.set("filename", path.display().to_string())?;
    module.set("loaded", false)?;

    state
        .borrow_mut()
        .loading
        .insert(path.to_path_buf(), Persistent::save(ctx, module.clone()));

    let executed = execute_module(state, ctx, owner_root, path, &module, &source);
    match executed {
        Ok(()) => {
            module.set("loaded", true)?;
            let exports: Value = module.get("exports")?;
            let mut st = state.borrow_mut();
            st.loading.remove(path);
            st.cache
                .insert(path.to_path_buf(), Persistent::save(ctx, exports.clone()));
            Ok(exports)
        }
        Err(e) => {
            // Errors are never cached: the next require starts over.
            state.borrow_mut().loading.remove(path);
            Err(e)
        }
    }
}

/// Compile and run one module body inside its owner's sandbox.
fn execute_module<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    owner_root: &Path,
    path: &Path,
    module: &Object<'js>,
    source: &str,
) -> rquickjs::Result<()> {
    let owner_name = state
        .borrow()
        .packages
        .get(owner_root)
        .map(|entry| entry.name.clone());
    let sandbox = sandbox_for(state, ctx, owner_name.as_deref())?;

    let dir = path.parent().unwrap_or(Path::new("/")).to_path_buf();
    let require_fn = make_require(state, ctx, owner_root, &dir)?;

    // The body runs strict: an assignment to an undeclared name throws a
    // ReferenceError instead of creating a property on the engine context's
    // shared global object, where other plugins would see it.
    let wrapped = format!(
        "(function ({}) {{ \"use strict\";\n{}\n}})",
        MODULE_PARAMS, source
    );
    let func: Function = ctx.eval(wrapped.into_bytes())?;

    let exports: Value = module.get("exports")?;
    let global_obj: Value = sandbox.get("global")?;
    let process_obj: Value = sandbox.get("process")?;
    let globals = ctx.globals();

    let mut args = Args::new(ctx.clone(), 14);
    args.push_arg(module.clone())?;
    args.push_arg(exports)?;
    args.push_arg(require_fn)?;
    args.push_arg(path.display().to_string())?;
    args.push_arg(dir.display().to_string())?;
    args.push_arg(global_obj)?;
    args.push_arg(process_obj)?;
    args.push_arg(Value::new_undefined(ctx.clone()))?; // Buffer
    for shim in [
        "setTimeout",
        "clearTimeout",
        "setInterval",
        "clearInterval",
        "setImmediate",
        "clearImmediate",
    ] {
        let f: Value = globals.get(shim)?;
        args.push_arg(f)?;
    }

    func.call_arg::<()>(args)
}

/// Build the per-module `require` function.
fn make_require<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    owner_root: &Path,
    from_dir: &Path,
) -> rquickjs::Result<Function<'js>> {
    let state = Rc::clone(state);
    let owner = owner_root.to_path_buf();
    let dir = from_dir.to_path_buf();
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, spec: String| {
        require_value(&state, &ctx, &owner, &dir, &spec)
    })
}

/// Load a host- or static-provided module, cached per key.
fn load_provided<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    key: &str,
    module: &ProvidedModule,
) -> rquickjs::Result<Value<'js>> {
    if let Some(cached) = state.borrow().provided.get(key).cloned() {
        return cached.restore(ctx);
    }

    let value = match module {
        ProvidedModule::Json(json) => json_to_js(ctx, json)?,
        ProvidedModule::Source(code) => {
            let (root, cwd) = {
                let st = state.borrow();
                (st.plugins_root.clone(), st.cwd.clone())
            };
            eval_module_source(state, ctx, key, code, &root, &cwd)?
        }
    };

    state
        .borrow_mut()
        .provided
        .insert(key.to_string(), Persistent::save(ctx, value.clone()));
    Ok(value)
}

/// Compile anonymous source as a module and return its exports. Used by
/// `run_script` and source-backed provided modules; never cached here.
fn eval_module_source<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    name: &str,
    source: &str,
    owner_root: &Path,
    from_dir: &Path,
) -> rquickjs::Result<Value<'js>> {
    let module = Object::new(ctx.clone())?;
    let exports = Object::new(ctx.clone())?;
    module.set("exports", exports)?;
    module.set("id", name)?;

    execute_module(state, ctx, owner_root, &from_dir.join(name), &module, source)?;
    module.get("exports")
}

/// Store the typed error and raise it as an engine exception.
fn throw_typed<'js, T>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    err: PluginError,
) -> rquickjs::Result<T> {
    let message = err.to_string();
    state.borrow_mut().pending_error = Some(err);
    Err(Exception::throw_message(ctx, &message))
}

/// Fetch or build the sandbox for a plugin (or the shared one).
fn sandbox_for<'js>(
    state: &Rc<RefCell<VmState>>,
    ctx: &Ctx<'js>,
    owner_name: Option<&str>,
) -> rquickjs::Result<Object<'js>> {
    let key = owner_name.unwrap_or(SHARED_SANDBOX).to_string();
    if let Some(cached) = state.borrow().sandboxes.get(&key).cloned() {
        return cached.restore(ctx);
    }

    let (template, host_env, cwd) = {
        let st = state.borrow();
        let template = st
            .templates
            .get(&key)
            .cloned()
            .unwrap_or_else(|| st.default_template.clone());
        (template, st.host_env.clone(), st.cwd.display().to_string())
    };

    debug!("Building sandbox for {}", key);
    let sandbox = build_sandbox(ctx, &template, &host_env, &cwd)?;
    state
        .borrow_mut()
        .sandboxes
        .insert(key, Persistent::save(ctx, sandbox.clone()));
    Ok(sandbox)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    /// A tiny on-disk store with an active view and a `.versions/` region.
    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        vm: PluginVm,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_options(VmOptions {
                require_core_modules: true,
                ..Default::default()
            })
        }

        fn with_options(options: VmOptions) -> Self {
            let dir = tempdir().unwrap();
            let root = dir.path().join("plugin_packages");
            fs::create_dir_all(root.join(".versions")).unwrap();
            let vm = PluginVm::new(
                Arc::new(RealRuntime),
                options,
                SandboxTemplate::default(),
                root.clone(),
                dir.path().to_path_buf(),
            )
            .unwrap();
            Fixture {
                _dir: dir,
                root,
                vm,
            }
        }

        /// Write an active plugin with the given files and register it.
        fn add_active(&self, name: &str, version: &str, files: &[(&str, &str)]) {
            self.add_active_with_deps(name, version, files, BTreeMap::new());
        }

        fn add_active_with_deps(
            &self,
            name: &str,
            version: &str,
            files: &[(&str, &str)],
            bindings: BTreeMap<String, String>,
        ) {
            let root = self.root.join(name);
            write_package(&root, name, version, files);
            self.vm
                .register_package(name, version, &root, bindings, true);
        }

        /// Write a versioned copy and register it.
        fn add_versioned(
            &self,
            name: &str,
            version: &str,
            files: &[(&str, &str)],
            bindings: BTreeMap<String, String>,
        ) {
            let root = self.root.join(".versions").join(format!("{}@{}", name, version));
            write_package(&root, name, version, files);
            self.vm
                .register_package(name, version, &root, bindings, false);
        }
    }

    fn write_package(root: &Path, name: &str, version: &str, files: &[(&str, &str)]) {
        fs::create_dir_all(root).unwrap();
        fs::write(
            root.join("package.json"),
            format!(r#"{{"name":"{}","version":"{}"}}"#, name, version),
        )
        .unwrap();
        for (rel, contents) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
    }

    #[test]
    fn test_require_basic_exports() {
        let fx = Fixture::new();
        fx.add_active(
            "basic",
            "1.0.0",
            &[("index.js", "module.exports = { myVariable: 'value1' };")],
        );

        let exports = fx.vm.require("basic").unwrap();
        assert_eq!(exports, serde_json::json!({"myVariable": "value1"}));
    }

    #[test]
    fn test_require_unknown_module_fails() {
        let fx = Fixture::new();
        let err = fx.vm.require("ghost").unwrap_err();
        assert!(matches!(err, PluginError::ModuleNotFound { .. }));
    }

    #[test]
    fn test_relative_require_and_exports_object() {
        let fx = Fixture::new();
        fx.add_active(
            "multi",
            "1.0.0",
            &[
                ("index.js", "var lib = require('./lib/util');\nmodule.exports = { doubled: lib.double(21) };"),
                ("lib/util.js", "exports.double = function (n) { return n * 2; };"),
            ],
        );

        let exports = fx.vm.require("multi").unwrap();
        assert_eq!(exports, serde_json::json!({"doubled": 42}));
    }

    #[test]
    fn test_require_json_file() {
        let fx = Fixture::new();
        fx.add_active(
            "jsonish",
            "1.0.0",
            &[
                ("index.js", "module.exports = require('./data.json');"),
                ("data.json", r#"{"kind": "fixture", "n": 3}"#),
            ],
        );

        let exports = fx.vm.require("jsonish").unwrap();
        assert_eq!(exports, serde_json::json!({"kind": "fixture", "n": 3}));
    }

    #[test]
    fn test_dependency_binding_is_honoured_over_active() {
        let fx = Fixture::new();
        // Active debug is 4.x; the plugin was linked to 2.6.9.
        fx.add_active("debug", "4.3.1", &[("index.js", "module.exports = 'v4';")]);
        fx.add_versioned(
            "debug",
            "2.6.9",
            &[("index.js", "module.exports = 'v2';")],
            BTreeMap::new(),
        );
        fx.add_active_with_deps(
            "consumer",
            "1.0.0",
            &[("index.js", "module.exports = { debug: require('debug'), version: require('debug/package.json').version };")],
            BTreeMap::from([("debug".to_string(), "2.6.9".to_string())]),
        );

        let exports = fx.vm.require("consumer").unwrap();
        assert_eq!(
            exports,
            serde_json::json!({"debug": "v2", "version": "2.6.9"})
        );

        // The active view still answers with the top-level version.
        assert_eq!(fx.vm.require("debug").unwrap(), serde_json::json!("v4"));
    }

    #[test]
    fn test_transitive_bindings() {
        let fx = Fixture::new();
        fx.add_versioned(
            "leaf",
            "1.0.0",
            &[("index.js", "module.exports = 'leaf-v1';")],
            BTreeMap::new(),
        );
        fx.add_versioned(
            "mid",
            "1.0.0",
            &[("index.js", "module.exports = 'mid(' + require('leaf') + ')';")],
            BTreeMap::from([("leaf".to_string(), "1.0.0".to_string())]),
        );
        fx.add_active_with_deps(
            "top",
            "1.0.0",
            &[("index.js", "module.exports = require('mid');")],
            BTreeMap::from([("mid".to_string(), "1.0.0".to_string())]),
        );

        assert_eq!(
            fx.vm.require("top").unwrap(),
            serde_json::json!("mid(leaf-v1)")
        );
    }

    #[test]
    fn test_export_cache_no_rerun() {
        let fx = Fixture::new();
        fx.add_active(
            "counted",
            "1.0.0",
            &[(
                "index.js",
                "global.__loads = (global.__loads || 0) + 1;\nmodule.exports = { loads: global.__loads };",
            )],
        );

        assert_eq!(fx.vm.require("counted").unwrap()["loads"], 1);
        assert_eq!(fx.vm.require("counted").unwrap()["loads"], 1);

        // Invalidation forces a re-run; the plugin sandbox persists so the
        // counter keeps its history.
        fx.vm.invalidate_plugin("counted");
        assert_eq!(fx.vm.require("counted").unwrap()["loads"], 2);
    }

    #[test]
    fn test_failed_require_is_never_cached() {
        let fx = Fixture::new();
        fx.add_active(
            "flaky",
            "1.0.0",
            &[("index.js", "throw new Error('boot failure');")],
        );

        for _ in 0..10 {
            let err = fx.vm.require("flaky").unwrap_err();
            match err {
                PluginError::ExecutionError { message, .. } => {
                    assert!(message.contains("boot failure"));
                }
                other => panic!("expected ExecutionError, got {:?}", other),
            }
        }

        // Fix the module on disk: the next require succeeds because nothing
        // negative was cached.
        fs::write(
            fx.root.join("flaky/index.js"),
            "module.exports = 'recovered';",
        )
        .unwrap();
        assert_eq!(fx.vm.require("flaky").unwrap(), serde_json::json!("recovered"));
    }

    #[test]
    fn test_circular_requires_get_partial_exports() {
        let fx = Fixture::new();
        fx.add_active(
            "cycle",
            "1.0.0",
            &[
                (
                    "index.js",
                    "exports.name = 'a';\nvar b = require('./b');\nexports.partnerSawName = b.sawName;",
                ),
                (
                    "b.js",
                    "var a = require('./index');\nexports.sawName = a.name;",
                ),
            ],
        );

        let exports = fx.vm.require("cycle").unwrap();
        assert_eq!(exports["partnerSawName"], "a");
    }

    #[test]
    fn test_static_dependency_wins() {
        let fx = Fixture::with_options(VmOptions {
            require_core_modules: true,
            static_dependencies: BTreeMap::from([(
                "config".to_string(),
                ProvidedModule::Json(serde_json::json!({"mode": "static"})),
            )]),
            ..Default::default()
        });
        fx.add_active(
            "uses-static",
            "1.0.0",
            &[("index.js", "module.exports = require('config').mode;")],
        );

        assert_eq!(fx.vm.require("uses-static").unwrap(), serde_json::json!("static"));
    }

    #[test]
    fn test_core_module_through_host_table() {
        let fx = Fixture::with_options(VmOptions {
            require_core_modules: true,
            host_modules: BTreeMap::from([(
                "path".to_string(),
                ProvidedModule::Source(
                    "exports.join = function () { return Array.prototype.join.call(arguments, '/'); };"
                        .to_string(),
                ),
            )]),
            ..Default::default()
        });
        fx.add_active(
            "uses-path",
            "1.0.0",
            &[("index.js", "module.exports = require('path').join('a', 'b');")],
        );

        assert_eq!(fx.vm.require("uses-path").unwrap(), serde_json::json!("a/b"));
    }

    #[test]
    fn test_core_module_precedence_follows_flag() {
        // A plugin is bound to an npm package named like a core module; the
        // flag decides whether the host's core module shadows it.
        let host_modules = BTreeMap::from([(
            "events".to_string(),
            ProvidedModule::Json(serde_json::json!("host-events")),
        )]);

        for (enabled, expected) in [(true, "host-events"), (false, "package-events")] {
            let fx = Fixture::with_options(VmOptions {
                require_core_modules: enabled,
                host_modules: host_modules.clone(),
                ..Default::default()
            });
            fx.add_versioned(
                "events",
                "1.0.0",
                &[("index.js", "module.exports = 'package-events';")],
                BTreeMap::new(),
            );
            fx.add_active_with_deps(
                "uses-events",
                "1.0.0",
                &[("index.js", "module.exports = require('events');")],
                BTreeMap::from([("events".to_string(), "1.0.0".to_string())]),
            );

            assert_eq!(
                fx.vm.require("uses-events").unwrap(),
                serde_json::json!(expected),
                "require_core_modules: {}",
                enabled
            );
        }
    }

    #[test]
    fn test_core_module_without_host_implementation_fails() {
        let fx = Fixture::new();
        fx.add_active(
            "uses-fs",
            "1.0.0",
            &[("index.js", "module.exports = require('fs');")],
        );

        let err = fx.vm.require("uses-fs").unwrap_err();
        assert!(matches!(err, PluginError::ModuleNotFound { .. }));
    }

    #[test]
    fn test_host_module_as_last_resort() {
        let fx = Fixture::with_options(VmOptions {
            require_core_modules: true,
            host_modules: BTreeMap::from([(
                "host-api".to_string(),
                ProvidedModule::Json(serde_json::json!({"hello": "from-host"})),
            )]),
            ..Default::default()
        });
        fx.add_active(
            "uses-host",
            "1.0.0",
            &[("index.js", "module.exports = require('host-api').hello;")],
        );

        assert_eq!(fx.vm.require("uses-host").unwrap(), serde_json::json!("from-host"));
    }

    #[test]
    fn test_sandbox_env_isolation() {
        let fx = Fixture::new();
        fx.vm.set_template(
            "sandboxed",
            Some(SandboxTemplate {
                env: Some(BTreeMap::from([("K".to_string(), "v".to_string())])),
                globals: None,
            }),
        );
        fx.add_active(
            "sandboxed",
            "1.0.0",
            &[("index.js", "module.exports = process.env.K;")],
        );
        fx.add_active(
            "plain",
            "1.0.0",
            &[("index.js", "module.exports = typeof process.env.K;")],
        );

        assert_eq!(fx.vm.require("sandboxed").unwrap(), serde_json::json!("v"));
        // Another plugin's env does not carry the template value.
        assert_eq!(fx.vm.require("plain").unwrap(), serde_json::json!("undefined"));
        // The host process env is untouched.
        assert!(std::env::var("K").is_err());
    }

    #[test]
    fn test_sandbox_globals_shared_within_plugin_not_across() {
        let fx = Fixture::new();
        fx.add_active(
            "writer",
            "1.0.0",
            &[
                ("index.js", "global.X = 'set-by-writer';\nmodule.exports = require('./reader');"),
                ("reader.js", "module.exports = global.X;"),
            ],
        );
        fx.add_active(
            "other",
            "1.0.0",
            &[("index.js", "module.exports = typeof global.X;")],
        );

        assert_eq!(fx.vm.require("writer").unwrap(), serde_json::json!("set-by-writer"));
        assert_eq!(fx.vm.require("other").unwrap(), serde_json::json!("undefined"));
    }

    #[test]
    fn test_undeclared_assignment_fails_and_does_not_leak() {
        let fx = Fixture::new();
        fx.add_active(
            "sloppy",
            "1.0.0",
            &[("index.js", "leaked = 5;\nmodule.exports = 'never';")],
        );
        fx.add_active(
            "bystander",
            "1.0.0",
            &[("index.js", "module.exports = typeof leaked;")],
        );

        // Strict compilation turns the implicit global into a ReferenceError.
        let err = fx.vm.require("sloppy").unwrap_err();
        match err {
            PluginError::ExecutionError { message, .. } => {
                assert!(message.contains("leaked"), "unexpected message: {}", message);
            }
            other => panic!("expected ExecutionError, got {:?}", other),
        }

        // Nothing landed on the shared global: neither another plugin nor a
        // script sees the name.
        assert_eq!(
            fx.vm.require("bystander").unwrap(),
            serde_json::json!("undefined")
        );
        assert_eq!(
            fx.vm.run_script("module.exports = typeof leaked;").unwrap(),
            serde_json::json!("undefined")
        );
    }

    #[test]
    fn test_caught_undeclared_assignment_stays_invisible() {
        let fx = Fixture::new();
        fx.add_active(
            "careful",
            "1.0.0",
            &[(
                "index.js",
                "try { leaked = 5; } catch (e) {}\nmodule.exports = 'ok';",
            )],
        );

        assert_eq!(fx.vm.require("careful").unwrap(), serde_json::json!("ok"));
        assert_eq!(
            fx.vm.run_script("module.exports = typeof leaked;").unwrap(),
            serde_json::json!("undefined")
        );
    }

    #[test]
    fn test_call_export() {
        let fx = Fixture::new();
        fx.add_active(
            "parser",
            "1.0.0",
            &[(
                "index.js",
                "exports.parse = function (s) {\n  var out = {};\n  s.split(';').forEach(function (pair) {\n    var kv = pair.split('=');\n    out[kv[0].trim()] = kv[1].trim();\n  });\n  return out;\n};",
            )],
        );

        let parsed = fx
            .vm
            .call_export("parser", "parse", &[serde_json::json!("foo=bar;x=y")])
            .unwrap();
        assert_eq!(parsed, serde_json::json!({"foo": "bar", "x": "y"}));
    }

    #[test]
    fn test_call_export_missing_function() {
        let fx = Fixture::new();
        fx.add_active("empty", "1.0.0", &[("index.js", "module.exports = {};")]);

        let err = fx.vm.call_export("empty", "nope", &[]).unwrap_err();
        assert!(matches!(err, PluginError::ExecutionError { .. }));
    }

    #[test]
    fn test_run_script_resolves_active_view() {
        let fx = Fixture::new();
        fx.add_active(
            "basic",
            "1.0.0",
            &[("index.js", "module.exports = { myVariable: 'value1' };")],
        );

        let result = fx
            .vm
            .run_script("module.exports = require('basic').myVariable;")
            .unwrap();
        assert_eq!(result, serde_json::json!("value1"));
    }

    #[test]
    fn test_run_script_throws_as_execution_error() {
        let fx = Fixture::new();
        let err = fx.vm.run_script("throw new Error('scripted');").unwrap_err();
        match err {
            PluginError::ExecutionError { message, .. } => assert!(message.contains("scripted")),
            other => panic!("expected ExecutionError, got {:?}", other),
        }
    }

    #[test]
    fn test_timer_shims_run_as_microtasks() {
        let fx = Fixture::new();
        fx.add_active(
            "timed",
            "1.0.0",
            &[(
                "index.js",
                "var state = { fired: false };\nsetTimeout(function () { state.fired = true; }, 5);\nmodule.exports = state;",
            )],
        );

        // The snapshot is taken before jobs run, so the flag is still false
        // here; the pump then fires the callback without error.
        let exports = fx.vm.require("timed").unwrap();
        assert_eq!(exports, serde_json::json!({"fired": false}));
    }

    #[test]
    fn test_invalidate_under_specific_root() {
        let fx = Fixture::new();
        fx.add_active(
            "stable",
            "1.0.0",
            &[("index.js", "global.__n = (global.__n || 0) + 1;\nmodule.exports = global.__n;")],
        );
        fx.add_active(
            "volatile",
            "1.0.0",
            &[("index.js", "global.__m = (global.__m || 0) + 1;\nmodule.exports = global.__m;")],
        );

        assert_eq!(fx.vm.require("stable").unwrap(), serde_json::json!(1));
        assert_eq!(fx.vm.require("volatile").unwrap(), serde_json::json!(1));

        fx.vm.invalidate_plugin("volatile");
        assert_eq!(fx.vm.require("volatile").unwrap(), serde_json::json!(2));
        assert_eq!(fx.vm.require("stable").unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_file_beats_directory_in_package() {
        let fx = Fixture::new();
        fx.add_active(
            "shadow",
            "1.0.0",
            &[
                ("index.js", "module.exports = require('./lib');"),
                ("lib.js", "module.exports = 'file';"),
                ("lib/index.js", "module.exports = 'directory';"),
            ],
        );

        assert_eq!(fx.vm.require("shadow").unwrap(), serde_json::json!("file"));
    }
}
