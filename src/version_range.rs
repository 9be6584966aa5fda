//! Version range parsing and satisfaction.
//!
//! Selectors arrive in npm notation; the `semver` crate speaks a close but
//! not identical dialect. This module normalises the differences: a bare
//! version means an exact match (npm) rather than a caret (cargo), comparator
//! sets are space-separated, `||` builds unions, and hyphen ranges expand to
//! a pair of comparators.

use semver::{Version, VersionReq};

use crate::error::PluginError;

/// A parsed npm-style version range: a union of comparator sets.
#[derive(Debug, Clone)]
pub struct VersionRange {
    source: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    /// Parse an npm-style range. Empty, `*`, `x`, and `latest` match anything.
    pub fn parse(selector: &str) -> Result<Self, PluginError> {
        let source = selector.trim();
        if matches!(source, "" | "*" | "x" | "X" | "latest") {
            return Ok(VersionRange {
                source: "*".to_string(),
                alternatives: vec![VersionReq::STAR],
            });
        }

        let mut alternatives = Vec::new();
        for alt in source.split("||") {
            let normalised = normalise_comparators(alt);
            let req = VersionReq::parse(&normalised).map_err(|e| PluginError::Manifest {
                name: source.to_string(),
                message: format!("invalid version range '{}': {}", alt.trim(), e),
            })?;
            alternatives.push(req);
        }

        Ok(VersionRange {
            source: source.to_string(),
            alternatives,
        })
    }

    /// The range as given (trimmed).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when `version` satisfies any alternative of the range.
    pub fn satisfies(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    /// The lowest concrete version mentioned anywhere in the range.
    ///
    /// Used by the `SatisfiesOrGreater` installed-check: any installed
    /// version at or above this floor counts as good enough.
    pub fn min_version(&self) -> Version {
        self.alternatives
            .iter()
            .flat_map(|req| req.comparators.iter())
            .map(|c| {
                Version::new(c.major, c.minor.unwrap_or(0), c.patch.unwrap_or(0))
            })
            .min()
            .unwrap_or_else(|| Version::new(0, 0, 0))
    }
}

/// Rewrite one npm comparator set into the `semver` crate's syntax.
fn normalise_comparators(alt: &str) -> String {
    let alt = alt.trim();

    // Hyphen range: "1.2.3 - 2.0.0" -> ">=1.2.3, <=2.0.0"
    if let Some((lo, hi)) = alt.split_once(" - ") {
        return format!(">={}, <={}", lo.trim(), hi.trim());
    }

    let parts: Vec<String> = alt
        .split_whitespace()
        .map(|tok| {
            // "1.2.x" wildcards: only whole segments, never prerelease text.
            let tok = tok
                .split('.')
                .map(|seg| if seg == "x" || seg == "X" { "*" } else { seg })
                .collect::<Vec<_>>()
                .join(".");
            // A bare version is an exact requirement in npm.
            if tok
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
                && Version::parse(&tok).is_ok()
            {
                format!("={}", tok)
            } else {
                tok
            }
        })
        .collect();

    parts.join(", ")
}

/// Parse a concrete version, tolerating a leading `v` or `=`.
pub fn parse_version(version: &str) -> Result<Version, PluginError> {
    let trimmed = version
        .trim()
        .trim_start_matches('=')
        .trim_start_matches('v');
    Version::parse(trimmed).map_err(|e| PluginError::Manifest {
        name: version.to_string(),
        message: format!("invalid version '{}': {}", version, e),
    })
}

/// Pick the highest of `versions` that satisfies `range`.
pub fn max_satisfying<'a, I>(versions: I, range: &VersionRange) -> Option<Version>
where
    I: IntoIterator<Item = &'a str>,
{
    versions
        .into_iter()
        .filter_map(|v| parse_version(v).ok())
        .filter(|v| range.satisfies(v))
        .max()
}
