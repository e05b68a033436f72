//! SDK references and import resolution hooks.
//!
//! A project can pull an SDK in through the `Sdk` attribute on `<Project>`
//! or `<Import>`.  Resolving an SDK name to a directory on disk is host
//! policy, so it sits behind the [`SdkResolver`] trait; the engine only
//! cares about the resolved path, from which it imports `Sdk.props` and
//! `Sdk.targets`.

use std::path::{Path, PathBuf};

/// A parsed SDK reference: `Name`, `Name/Version` or `Name/min=Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdkReference {
    pub name: String,
    pub version: Option<String>,
    pub minimum_version: Option<String>,
}

impl SdkReference {
    /// Parse a reference from attribute text.  Returns `None` for empty or
    /// malformed specs.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once('/') {
            None => Some(Self { name: spec.to_string(), version: None, minimum_version: None }),
            Some((name, rest)) => {
                let name = name.trim();
                let rest = rest.trim();
                if name.is_empty() || rest.is_empty() {
                    return None;
                }
                let (version, minimum) = match rest.strip_prefix("min=") {
                    Some(min) => (None, Some(min.to_string())),
                    None => (Some(rest.to_string()), None),
                };
                Some(Self { name: name.to_string(), version, minimum_version: minimum })
            }
        }
    }
}

impl std::fmt::Display for SdkReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(v) = &self.version {
            write!(f, "/{v}")?;
        } else if let Some(m) = &self.minimum_version {
            write!(f, "/min={m}")?;
        }
        Ok(())
    }
}

/// Maps an SDK reference to the directory holding its `Sdk.props` and
/// `Sdk.targets`.
pub trait SdkResolver: Send + Sync {
    fn resolve(&self, sdk: &SdkReference, project_file: &Path) -> Option<PathBuf>;
}

/// Resolver over a fixed SDK root directory laid out as
/// `<root>/<SdkName>/Sdk/`.
pub struct DirectorySdkResolver {
    root: PathBuf,
}

impl DirectorySdkResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SdkResolver for DirectorySdkResolver {
    fn resolve(&self, sdk: &SdkReference, _project_file: &Path) -> Option<PathBuf> {
        let dir = self.root.join(&sdk.name).join("Sdk");
        dir.is_dir().then_some(dir)
    }
}

/// A fallback location list for `<Import Project="$(Prop)\...">` specs:
/// when the property is undefined or the resolved file is missing, each
/// path is tried as the property's value in turn.
#[derive(Debug, Clone)]
pub struct ImportSearchPath {
    /// Property name as it appears in import specs, e.g.
    /// `MSBuildExtensionsPath`.
    pub property: String,
    pub paths: Vec<PathBuf>,
}

impl ImportSearchPath {
    pub fn new(property: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self { property: property.into(), paths }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
