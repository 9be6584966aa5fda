//! File and directory resolution mechanics for the CommonJS loader.
//!
//! Pure path probing, shared by every resolution branch: extension
//! resolution (exact, `.js`, `.json`), directory resolution (`package.json`
//! `main`, then `index.js`), and the rule that a file beats a directory of
//! the same name.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::manifest::PackageManifest;
use crate::runtime::Runtime;

/// Core-module names of the Node runtime this loader emulates. Requests for
/// these resolve through the host-modules table when `require_core_modules`
/// is on.
pub const CORE_MODULES: &[&str] = &[
    "assert",
    "async_hooks",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "inspector",
    "module",
    "net",
    "os",
    "path",
    "perf_hooks",
    "process",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "worker_threads",
    "zlib",
];

/// True when `name` (optionally `node:`-prefixed) is a core-module name.
pub fn is_core_module(name: &str) -> bool {
    let bare = name.strip_prefix("node:").unwrap_or(name);
    CORE_MODULES.contains(&bare)
}

/// Path prober backed by the runtime abstraction.
pub struct FileResolver {
    runtime: Arc<dyn Runtime>,
}

impl FileResolver {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        FileResolver { runtime }
    }

    /// Full resolution of a path-ish request: try it as a file first, then
    /// as a directory. A file named `x.js` wins over a directory named `x`.
    pub fn resolve(&self, base: &Path) -> Option<PathBuf> {
        self.resolve_as_file(base)
            .or_else(|| self.resolve_as_dir(base))
    }

    /// Extension resolution: exact path, then `.js`, then `.json`.
    pub fn resolve_as_file(&self, base: &Path) -> Option<PathBuf> {
        if self.runtime.is_file(base) {
            return Some(base.to_path_buf());
        }
        for ext in ["js", "json"] {
            let candidate = append_extension(base, ext);
            if self.runtime.is_file(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Directory resolution: the `main` of `<dir>/package.json`, then
    /// `<dir>/index.js`.
    pub fn resolve_as_dir(&self, dir: &Path) -> Option<PathBuf> {
        if !self.runtime.is_dir(dir) {
            return None;
        }

        if let Ok(contents) = self.runtime.read_to_string(&dir.join("package.json"))
            && let Ok(manifest) = PackageManifest::parse(&dir.display().to_string(), &contents)
            && let Some(found) = self.resolve_as_file(&dir.join(&manifest.main))
        {
            return Some(found);
        }

        let index = dir.join("index.js");
        self.runtime.is_file(&index).then_some(index)
    }

    /// Canonical form of a resolved file, for use as a cache key.
    pub fn canonical(&self, path: &Path) -> PathBuf {
        self.runtime
            .canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Append (not replace) an extension: `lib/a.min` + `js` -> `lib/a.min.js`.
fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

/// Lexically normalise `..` and `.` components without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RealRuntime;
    use std::fs;
    use tempfile::tempdir;

    fn resolver() -> FileResolver {
        FileResolver::new(Arc::new(RealRuntime))
    }

    #[test]
    fn test_is_core_module() {
        assert!(is_core_module("path"));
        assert!(is_core_module("node:fs"));
        assert!(!is_core_module("cookie"));
        assert!(!is_core_module("node:cookie"));
    }

    #[test]
    fn test_extension_resolution_order() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("mod.js"), "").unwrap();
        fs::write(dir.path().join("data.json"), "{}").unwrap();

        let r = resolver();
        assert_eq!(
            r.resolve_as_file(&dir.path().join("mod")),
            Some(dir.path().join("mod.js"))
        );
        assert_eq!(
            r.resolve_as_file(&dir.path().join("data")),
            Some(dir.path().join("data.json"))
        );
        assert_eq!(
            r.resolve_as_file(&dir.path().join("mod.js")),
            Some(dir.path().join("mod.js"))
        );
        assert!(r.resolve_as_file(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_file_wins_over_directory() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("thing")).unwrap();
        fs::write(dir.path().join("thing/index.js"), "").unwrap();
        fs::write(dir.path().join("thing.js"), "").unwrap();

        let r = resolver();
        assert_eq!(
            r.resolve(&dir.path().join("thing")),
            Some(dir.path().join("thing.js"))
        );
    }

    #[test]
    fn test_directory_resolution_uses_manifest_main() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir(&pkg).unwrap();
        fs::write(
            pkg.join("package.json"),
            r#"{"name":"pkg","version":"1.0.0","main":"lib/entry.js"}"#,
        )
        .unwrap();
        fs::create_dir(pkg.join("lib")).unwrap();
        fs::write(pkg.join("lib/entry.js"), "").unwrap();
        fs::write(pkg.join("index.js"), "").unwrap();

        assert_eq!(resolver().resolve(&pkg), Some(pkg.join("lib/entry.js")));
    }

    #[test]
    fn test_directory_resolution_falls_back_to_index() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join("index.js"), "").unwrap();

        assert_eq!(resolver().resolve(&pkg), Some(pkg.join("index.js")));
    }

    #[test]
    fn test_directory_with_main_missing_extension() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("pkg");
        fs::create_dir(&pkg).unwrap();
        fs::write(
            pkg.join("package.json"),
            r#"{"name":"pkg","version":"1.0.0","main":"entry"}"#,
        )
        .unwrap();
        fs::write(pkg.join("entry.js"), "").unwrap();

        assert_eq!(resolver().resolve(&pkg), Some(pkg.join("entry.js")));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize(Path::new("/a/../../b")), PathBuf::from("/b"));
    }
}
