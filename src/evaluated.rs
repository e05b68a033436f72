//! Evaluation results: properties, items and targets after expansion.
//!
//! These types are what a [`crate::engine::ProjectInstance`] hands back to
//! callers.  They are plain owned data; the unevaluated XML model they were
//! produced from lives in [`crate::project`].

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::project::{Item, Target};

// ═══════════════════════════════════════════════════════════════════════════════
//  Properties
// ═══════════════════════════════════════════════════════════════════════════════

/// A property after evaluation.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,
    /// The raw value as written in the project file.
    pub value: String,
    /// The value after `$()` expansion.
    pub final_value: String,
    /// Whether the winning definition came from an imported file.
    pub is_imported: bool,
    /// Whether more than one definition was seen; the recorded value is the
    /// last one.
    pub defined_multiple_times: bool,
}

impl PropertyInfo {
    pub(crate) fn new(name: &str, value: &str, final_value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            final_value: final_value.to_string(),
            is_imported: false,
            defined_multiple_times: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Items
// ═══════════════════════════════════════════════════════════════════════════════

/// One piece of metadata on an evaluated item.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataValue {
    /// The raw value as written.
    pub value: String,
    /// The value after expansion.
    pub final_value: String,
}

impl MetadataValue {
    pub(crate) fn new(value: &str, final_value: &str) -> Self {
        Self { value: value.to_string(), final_value: final_value.to_string() }
    }
}

/// An item after evaluation.  A wildcard include produces one of these per
/// matched file; each carries back-references to the source elements that
/// contributed to it.
#[derive(Debug, Clone)]
pub struct EvaluatedItem {
    /// Item type, e.g. `Compile`.
    pub name: String,
    /// The `Include` text before expansion.
    pub unevaluated_include: String,
    /// The expanded include, one value (never a `;` list).
    pub include: String,
    pub condition: Option<String>,
    /// Whether the item came from an imported file.
    pub is_imported: bool,
    /// `%(RecursiveDir)`: the path fragment a `**` matched, with a trailing
    /// separator, or empty.
    pub recursive_dir: String,
    /// Custom metadata in definition order.
    pub metadata: IndexMap<String, MetadataValue>,
    /// Source elements, in the order they touched this item (the include
    /// first, then any updates).
    pub sources: Vec<Arc<Item>>,
}

impl EvaluatedItem {
    pub(crate) fn new(name: &str, unevaluated_include: &str, include: &str) -> Self {
        Self {
            name: name.to_string(),
            unevaluated_include: unevaluated_include.to_string(),
            include: include.to_string(),
            condition: None,
            is_imported: false,
            recursive_dir: String::new(),
            metadata: IndexMap::new(),
            sources: Vec::new(),
        }
    }

    /// Custom metadata value, if defined.
    pub fn metadata_value(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(|m| m.final_value.as_str())
    }

    pub fn has_metadata(&self, name: &str) -> bool {
        self.metadata.contains_key(name)
    }

    /// Resolve a metadata reference: custom metadata first, then the
    /// well-known names derived from the include path.
    pub fn metadata_or_well_known(&self, name: &str, base_directory: &Path) -> Option<String> {
        if let Some(value) = self.metadata_value(name) {
            return Some(value.to_string());
        }
        self.well_known_metadata(name, base_directory)
    }

    /// The path-derived metadata MSBuild defines on every item.
    /// Returns `None` for names that are not well-known.
    pub fn well_known_metadata(&self, name: &str, base_directory: &Path) -> Option<String> {
        let include = self.include.as_str();
        match name {
            "Identity" => Some(include.to_string()),
            "Filename" => Some(
                Path::new(include)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("")
                    .to_string(),
            ),
            "Extension" => Some(
                Path::new(include)
                    .extension()
                    .and_then(|s| s.to_str())
                    .map(|e| format!(".{e}"))
                    .unwrap_or_default(),
            ),
            "FullPath" => {
                let path = Path::new(include);
                let full = if path.is_relative() { base_directory.join(path) } else { path.to_path_buf() };
                Some(full.to_string_lossy().replace('\\', "/"))
            }
            "Directory" => {
                let full = self.well_known_metadata("FullPath", base_directory)?;
                let slash = full.rfind('/').map(|i| i + 1).unwrap_or(0);
                Some(full[..slash].to_string())
            }
            "RelativeDir" => {
                let slash = include.rfind(['/', '\\']).map(|i| i + 1).unwrap_or(0);
                Some(include[..slash].to_string())
            }
            "RecursiveDir" => Some(self.recursive_dir.clone()),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Targets
// ═══════════════════════════════════════════════════════════════════════════════

/// A target recorded during evaluation, with its attribute expressions
/// expanded.  This engine surfaces targets, it does not run them.
#[derive(Debug, Clone)]
pub struct EvaluatedTarget {
    pub target: Target,
    pub is_imported: bool,
}

impl EvaluatedTarget {
    pub fn name(&self) -> &str {
        &self.target.name
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
