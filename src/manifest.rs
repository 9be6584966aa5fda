//! Package manifests and installed-plugin metadata.
//!
//! A [`PackageManifest`] is the subset of `package.json` the manager cares
//! about. A [`PluginInfo`] describes one installed `(name, version)` pair
//! together with the exact dependency versions the loader will honour for it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Default entry file when `package.json` has no `main` field.
pub const DEFAULT_MAIN: &str = "index.js";

/// Metadata read from a `package.json`. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageManifest {
    /// Package name, possibly `@scope/name`.
    pub name: String,
    /// Concrete version string.
    pub version: String,
    /// Entry file relative to the package root.
    #[serde(default = "default_main")]
    pub main: String,
    /// Declared dependencies: name -> selector.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Dependencies whose installation failures are tolerated.
    #[serde(default, rename = "optionalDependencies")]
    pub optional_dependencies: BTreeMap<String, String>,
}

fn default_main() -> String {
    DEFAULT_MAIN.to_string()
}

impl PackageManifest {
    /// Build a manifest from raw fields; used by the inline fetcher.
    pub fn synthetic(name: &str, version: &str) -> Self {
        PackageManifest {
            name: name.to_string(),
            version: version.to_string(),
            main: DEFAULT_MAIN.to_string(),
            dependencies: BTreeMap::new(),
            optional_dependencies: BTreeMap::new(),
        }
    }

    /// Parse the JSON contents of a `package.json`.
    pub fn parse(name_hint: &str, contents: &str) -> Result<Self, PluginError> {
        serde_json::from_str(contents).map_err(|e| PluginError::Manifest {
            name: name_hint.to_string(),
            message: e.to_string(),
        })
    }

    /// Load and parse `<dir>/package.json`.
    pub fn load(dir: &Path) -> Result<Self, PluginError> {
        let path = dir.join("package.json");
        let contents =
            std::fs::read_to_string(&path).map_err(|e| PluginError::io(path.clone(), e))?;
        Self::parse(&dir.display().to_string(), &contents)
    }
}

/// A single installed `(name, version)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginInfo {
    /// Package name.
    pub name: String,
    /// Installed version.
    pub version: String,
    /// Absolute path of the entry file.
    pub main_file: PathBuf,
    /// Absolute directory holding the installed files.
    pub location: PathBuf,
    /// Flattened dependency map the loader honours: name -> bound version.
    pub dependencies: BTreeMap<String, String>,
    /// The exact resolved manifest each dependency was linked to.
    pub dependency_details: BTreeMap<String, PackageManifest>,
}

impl PluginInfo {
    /// Build the info for a package materialised at `location`.
    pub fn from_manifest(manifest: &PackageManifest, location: PathBuf) -> Self {
        let main_file = location.join(&manifest.main);
        PluginInfo {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            main_file,
            location,
            dependencies: BTreeMap::new(),
            dependency_details: BTreeMap::new(),
        }
    }
}

/// Validate a plugin name given to a public method.
///
/// Names follow registry rules: non-empty, lowercase, no path traversal, an
/// optional `@scope/` prefix, and URL-safe punctuation only.
pub fn validate_plugin_name(name: &str) -> Result<(), PluginError> {
    let invalid = |reason: &str| PluginError::InvalidPluginName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    if name == "." || name == ".." || name.starts_with("./") || name.starts_with("../") {
        return Err(invalid("name must not be a relative path"));
    }
    if name.contains('\\') || name.contains("..") {
        return Err(invalid("name must not traverse directories"));
    }

    let (scope, bare) = match name.strip_prefix('@') {
        Some(rest) => match rest.split_once('/') {
            Some((scope, bare)) => (Some(scope), bare),
            None => return Err(invalid("scoped name must be '@scope/name'")),
        },
        None => (None, name),
    };

    if bare.is_empty() || bare.contains('/') {
        return Err(invalid("name must have exactly one '/' after the scope"));
    }
    for part in scope.iter().copied().chain(std::iter::once(bare)) {
        let Some(first) = part.chars().next() else {
            return Err(invalid("name segments must not be empty"));
        };
        if !(first.is_ascii_lowercase() || first.is_ascii_digit() || first == '~') {
            return Err(invalid("segments must start with a lowercase letter or digit"));
        }
        if !part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-._~".contains(c))
        {
            return Err(invalid("only lowercase letters, digits, and -._~ are allowed"));
        }
    }

    Ok(())
}

/// Split a require specifier into its package head and the in-package rest.
///
/// `"debug/package.json"` -> `("debug", Some("package.json"))`;
/// `"@scope/pkg/lib/x"` -> `("@scope/pkg", Some("lib/x"))`.
pub fn split_specifier(spec: &str) -> (&str, Option<&str>) {
    let boundary = if spec.starts_with('@') {
        // Scoped: the head spans the first two segments.
        spec.find('/')
            .and_then(|first| spec[first + 1..].find('/').map(|second| first + 1 + second))
    } else {
        spec.find('/')
    };

    match boundary {
        Some(idx) => (&spec[..idx], Some(&spec[idx + 1..])),
        None => (spec, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest =
            PackageManifest::parse("test", r#"{"name": "cookie", "version": "0.3.1"}"#).unwrap();
        assert_eq!(manifest.name, "cookie");
        assert_eq!(manifest.version, "0.3.1");
        assert_eq!(manifest.main, "index.js");
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn test_parse_full_manifest() {
        let manifest = PackageManifest::parse(
            "test",
            r#"{
                "name": "@acme/widget",
                "version": "2.1.0",
                "main": "lib/entry.js",
                "dependencies": {"debug": "^2.0.0"},
                "optionalDependencies": {"fsevents": "*"},
                "scripts": {"test": "ignored"}
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.name, "@acme/widget");
        assert_eq!(manifest.main, "lib/entry.js");
        assert_eq!(manifest.dependencies.get("debug").unwrap(), "^2.0.0");
        assert_eq!(manifest.optional_dependencies.get("fsevents").unwrap(), "*");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PackageManifest::parse("test", "not json").is_err());
        assert!(PackageManifest::parse("test", r#"{"version": "1.0.0"}"#).is_err());
    }

    #[test]
    fn test_plugin_info_main_file() {
        let manifest = PackageManifest::parse(
            "test",
            r#"{"name": "a", "version": "1.0.0", "main": "lib/a.js"}"#,
        )
        .unwrap();
        let info = PluginInfo::from_manifest(&manifest, PathBuf::from("/store/a"));
        assert_eq!(info.main_file, PathBuf::from("/store/a/lib/a.js"));
        assert_eq!(info.location, PathBuf::from("/store/a"));
    }

    #[test]
    fn test_validate_accepts_plain_names() {
        assert!(validate_plugin_name("cookie").is_ok());
        assert!(validate_plugin_name("my-plugin-2").is_ok());
        assert!(validate_plugin_name("under_score").is_ok());
    }

    #[test]
    fn test_validate_accepts_scoped_names() {
        assert!(validate_plugin_name("@scope/pkg").is_ok());
        assert!(validate_plugin_name("@my-org/my.pkg").is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(validate_plugin_name("").is_err());
        assert!(validate_plugin_name("  ").is_err());
        assert!(validate_plugin_name(".").is_err());
        assert!(validate_plugin_name("..").is_err());
        assert!(validate_plugin_name("./local").is_err());
        assert!(validate_plugin_name("../up").is_err());
        assert!(validate_plugin_name("a/../b").is_err());
        assert!(validate_plugin_name("Uppercase").is_err());
        assert!(validate_plugin_name("@scope").is_err());
        assert!(validate_plugin_name("@scope/a/b").is_err());
        assert!(validate_plugin_name("sp ace").is_err());
    }

    #[test]
    fn test_split_specifier() {
        assert_eq!(split_specifier("debug"), ("debug", None));
        assert_eq!(
            split_specifier("debug/package.json"),
            ("debug", Some("package.json"))
        );
        assert_eq!(split_specifier("@scope/pkg"), ("@scope/pkg", None));
        assert_eq!(
            split_specifier("@scope/pkg/lib/x.js"),
            ("@scope/pkg", Some("lib/x.js"))
        );
    }
}
