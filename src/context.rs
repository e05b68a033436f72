//! Property expansion context.
//!
//! [`EvaluationContext`] holds the property state of one evaluation run and
//! expands `$(...)` and `%(...)` references in text.  It knows nothing about
//! items: an `@(...)` item reference is left verbatim in the output and
//! flagged, and the engine substitutes it when (and if) items are available.
//!
//! Property lookups walk, in order: the file-scope stack (reserved
//! `MSBuildThisFile*` values and per-import overrides), the reserved
//! project-level properties, the mutable property table, and finally the
//! process environment.  Undefined names expand to the empty string.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use log::debug;

use crate::condition::{is_property_name, matching_paren};
use crate::evaluated::EvaluatedItem;
use crate::transform::apply_string_function;

// ═══════════════════════════════════════════════════════════════════════════════
//  Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of expanding a piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub text: String,
    /// Whether the text contained an `@(...)` reference that was left
    /// unexpanded.
    pub needs_items: bool,
}

/// Item bound to `%(...)` references while expanding per-item text.
pub struct ItemScope<'a> {
    pub item: &'a EvaluatedItem,
    pub base_directory: &'a Path,
}

impl ItemScope<'_> {
    fn metadata(&self, name: &str) -> String {
        // `%(ItemType.Name)` and `%(Name)` both resolve on the bound item.
        let name = name.rsplit('.').next().unwrap_or(name);
        self.item
            .metadata_or_well_known(name, self.base_directory)
            .unwrap_or_default()
    }
}

struct FileScope {
    file: Option<PathBuf>,
    /// Lowercased name -> value.
    properties: HashMap<String, String>,
}

/// Property state for one evaluation of one project.
pub struct EvaluationContext {
    /// Lowercased name -> value.
    properties: HashMap<String, String>,
    /// Reserved `MSBuildProject*` values, plus `MSBuildThisFile*` fallbacks
    /// for the root project file itself.
    project_scope: FileScope,
    project_directory: PathBuf,
    /// Pushed while evaluating imported files and search-path candidates.
    scopes: Vec<FileScope>,
    /// Properties whose value contained an `@(...)` reference, in definition
    /// order; they get a second expansion once items exist.
    transform_properties: IndexSet<String>,
}

impl EvaluationContext {
    /// Create a context rooted at a project file, with the reserved
    /// `MSBuildProject*` and `MSBuildThisFile*` properties in place.
    pub fn new(project_file: &Path) -> Self {
        let mut reserved = this_file_properties(project_file);
        let directory = parent_dir(project_file);
        let dir_text = path_text(&directory);
        reserved.insert("msbuildprojectdirectory".into(), dir_text);
        reserved.insert(
            "msbuildprojectfile".into(),
            file_text(project_file.file_name()),
        );
        reserved.insert(
            "msbuildprojectname".into(),
            file_text(project_file.file_stem()),
        );
        reserved.insert(
            "msbuildprojectextension".into(),
            project_file
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"))
                .unwrap_or_default(),
        );
        reserved.insert("msbuildprojectfullpath".into(), path_text(project_file));

        Self {
            properties: HashMap::new(),
            project_scope: FileScope { file: Some(project_file.to_path_buf()), properties: reserved },
            project_directory: directory,
            scopes: Vec::new(),
            transform_properties: IndexSet::new(),
        }
    }

    // ── Properties ───────────────────────────────────────────────────────

    /// Set a property value.  Names are case-insensitive.
    pub fn set_property(&mut self, name: &str, value: &str) {
        self.properties.insert(name.to_ascii_lowercase(), value.to_string());
    }

    /// Look a property up: file scopes first, then reserved project values,
    /// then the property table, then the environment.
    pub fn property(&self, name: &str) -> Option<String> {
        let key = name.to_ascii_lowercase();
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.properties.get(&key) {
                return Some(v.clone());
            }
        }
        if let Some(v) = self.project_scope.properties.get(&key) {
            return Some(v.clone());
        }
        if let Some(v) = self.properties.get(&key) {
            return Some(v.clone());
        }
        std::env::var(name).ok()
    }

    /// The directory of the project being evaluated.
    pub fn project_directory(&self) -> &Path {
        &self.project_directory
    }

    /// The directory of the file currently being evaluated (the innermost
    /// import, or the project itself).
    pub fn current_directory(&self) -> PathBuf {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.file.as_deref())
            .map(parent_dir)
            .unwrap_or_else(|| self.project_directory.clone())
    }

    // ── File scopes ──────────────────────────────────────────────────────

    /// Enter an imported file: its `MSBuildThisFile*` values shadow the
    /// outer ones until [`pop_scope`](Self::pop_scope).
    pub fn push_file_scope(&mut self, file: &Path) {
        self.scopes.push(FileScope {
            file: Some(file.to_path_buf()),
            properties: this_file_properties(file),
        });
    }

    /// Enter a scope that only overrides the given properties, e.g. binding
    /// a search-path property to a candidate directory while resolving an
    /// import.
    pub fn push_override_scope(&mut self, overrides: &[(&str, &str)]) {
        self.scopes.push(FileScope {
            file: None,
            properties: overrides
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
        });
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // ── Deferred transforms ──────────────────────────────────────────────

    /// Record a property whose value needs a second expansion once items
    /// are known.
    pub fn note_transform_property(&mut self, name: &str) {
        self.transform_properties.insert(name.to_string());
    }

    pub fn transform_properties(&self) -> impl Iterator<Item = &str> {
        self.transform_properties.iter().map(String::as_str)
    }

    // ── Expansion ────────────────────────────────────────────────────────

    /// Expand `$(...)` and `%(...)` references in `text`.
    pub fn evaluate(&self, text: &str) -> Evaluated {
        self.evaluate_with(text, None)
    }

    /// Expand with an item bound for `%(...)` references.
    pub fn evaluate_with(&self, text: &str, item: Option<&ItemScope<'_>>) -> Evaluated {
        if !text.contains('$') && !text.contains('%') && !text.contains('@') {
            return Evaluated { text: text.to_string(), needs_items: false };
        }

        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut needs_items = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if (c == '$' || c == '%' || c == '@') && chars.get(i + 1) == Some(&'(') {
                if let Some(end) = matching_paren(&chars, i + 1) {
                    let inner: String = chars[i + 2..end].iter().collect();
                    match c {
                        '$' => out.push_str(&self.expand_property_ref(&inner, item)),
                        '%' => match item {
                            Some(scope) => out.push_str(&scope.metadata(&inner)),
                            None => {}
                        },
                        _ => {
                            // Item references need the engine's item state;
                            // keep the text and flag it.
                            out.extend(&chars[i..=end]);
                            needs_items = true;
                        }
                    }
                    i = end + 1;
                    continue;
                }
            }
            out.push(c);
            i += 1;
        }

        Evaluated { text: out, needs_items }
    }

    /// Expand the inside of a `$(...)` reference: a plain property name, or
    /// a member chain like `Configuration.ToUpper().Trim()`.
    fn expand_property_ref(&self, inner: &str, item: Option<&ItemScope<'_>>) -> String {
        let inner = inner.trim();
        if is_property_name(inner) {
            return self.property(inner).unwrap_or_default();
        }

        let segments = split_member_chain(inner);
        let Some((first, calls)) = segments.split_first() else {
            return String::new();
        };
        if !is_property_name(first.trim()) {
            debug!("unsupported property expression '$({inner})', expanding to empty");
            return String::new();
        }

        let mut value = self.property(first.trim()).unwrap_or_default();
        for call in calls {
            match self.apply_member(&value, call.trim(), item) {
                Some(next) => value = next,
                None => {
                    debug!("unsupported member '{call}' in '$({inner})', expanding to empty");
                    return String::new();
                }
            }
        }
        value
    }

    fn apply_member(
        &self,
        value: &str,
        call: &str,
        item: Option<&ItemScope<'_>>,
    ) -> Option<String> {
        let (name, args) = match call.find('(') {
            None => (call, Vec::new()),
            Some(open) => {
                if !call.ends_with(')') {
                    return None;
                }
                let raw_args = &call[open + 1..call.len() - 1];
                let args = split_call_args(raw_args)
                    .into_iter()
                    .map(|a| self.evaluate_with(&unquote(a.trim()), item).text)
                    .collect();
                (&call[..open], args)
            }
        };
        apply_string_function(value, name, &args)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Text helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Split a member chain on dots that sit outside parentheses and quotes.
fn split_member_chain(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            q @ ('\'' | '"') => {
                if quote == Some(q) {
                    quote = None;
                } else if quote.is_none() {
                    quote = Some(q);
                }
            }
            '(' if quote.is_none() => depth += 1,
            ')' if quote.is_none() => depth = depth.saturating_sub(1),
            '.' if quote.is_none() && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Split call arguments on top-level commas.
pub(crate) fn split_call_args(s: &str) -> Vec<&str> {
    let s = s.trim();
    if s.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            q @ ('\'' | '"') => {
                if quote == Some(q) {
                    quote = None;
                } else if quote.is_none() {
                    quote = Some(q);
                }
            }
            '(' if quote.is_none() => depth += 1,
            ')' if quote.is_none() => depth = depth.saturating_sub(1),
            ',' if quote.is_none() && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Strip one layer of matching quotes.
pub(crate) fn unquote(s: &str) -> String {
    let b = s.as_bytes();
    if b.len() >= 2 && (b[0] == b'\'' || b[0] == b'"') && b[b.len() - 1] == b[0] {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn file_text(name: Option<&std::ffi::OsStr>) -> String {
    name.and_then(|n| n.to_str()).unwrap_or("").to_string()
}

fn this_file_properties(file: &Path) -> HashMap<String, String> {
    let mut props = HashMap::new();
    props.insert("msbuildthisfile".into(), file_text(file.file_name()));
    props.insert("msbuildthisfilename".into(), file_text(file.file_stem()));
    props.insert(
        "msbuildthisfileextension".into(),
        file.extension().and_then(|e| e.to_str()).map(|e| format!(".{e}")).unwrap_or_default(),
    );
    props.insert("msbuildthisfilefullpath".into(), path_text(file));
    props.insert(
        "msbuildthisfiledirectory".into(),
        format!("{}/", path_text(&parent_dir(file))),
    );
    props
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
