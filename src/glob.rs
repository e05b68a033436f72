//! Wildcard include/exclude handling.
//!
//! MSBuild item specs mix literal path segments with `*`, `?` and the
//! recursive `**`.  A pattern is compiled once into a list of per-segment
//! matchers ([`Segment`]) that can either be tested against a path string or
//! expanded against the filesystem.
//!
//! Paths and patterns are normalized to `/` separators; matching is
//! case-sensitive.  Directory listings are visited in sorted order, files
//! before subdirectories, so expansion is deterministic.

use std::path::{Path, PathBuf};

// ═══════════════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Replace backslashes with forward slashes.
pub fn normalize_slashes(s: &str) -> String {
    s.replace('\\', "/")
}

/// Whether a spec contains wildcard characters.
pub fn is_wildcard(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Split a `;`-separated spec into trimmed, non-empty entries.
pub fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(';').map(str::trim).filter(|p| !p.is_empty())
}

/// Match a single path segment against a pattern with `*` and `?`.
fn segment_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    // Two-pointer scan with star backtracking.
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Compiled patterns
// ═══════════════════════════════════════════════════════════════════════════════

/// One path segment of a compiled glob.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// An exact segment, compared literally.
    Literal(String),
    /// `**`, matching zero or more segments.
    AnyLevel,
    /// A segment with `*`/`?` wildcards.
    Pattern(String),
}

/// A compiled include/exclude pattern.
#[derive(Debug, Clone)]
pub struct CompiledGlob {
    /// The normalized source pattern.
    pattern: String,
    /// Whether the pattern is rooted at the filesystem root.
    absolute: bool,
    segments: Vec<Segment>,
}

impl CompiledGlob {
    /// Compile a pattern.  A trailing `**` is treated as `**/*`, matching
    /// everything below that point.
    pub fn compile(pattern: &str) -> Self {
        let mut normalized = normalize_slashes(pattern.trim());
        if normalized == "**" || normalized.ends_with("/**") {
            normalized.push_str("/*");
        }
        let absolute = normalized.starts_with('/');
        let segments = normalized
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Segment::AnyLevel
                } else if is_wildcard(s) {
                    Segment::Pattern(s.to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        Self { pattern: normalized, absolute, segments }
    }

    /// The normalized pattern text.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Test a path (in the same relative/absolute flavor as the pattern)
    /// against this glob.
    pub fn matches(&self, path: &str) -> bool {
        let normalized = normalize_slashes(path);
        if self.absolute != normalized.starts_with('/') {
            return false;
        }
        let parts: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
        match_segments(&self.segments, &parts)
    }

    /// Expand the glob against the filesystem.  Relative patterns resolve
    /// against `base_dir`; matches come back in the pattern's path flavor.
    pub fn expand(&self, base_dir: &Path, options: &ExpandOptions<'_>) -> Vec<GlobMatch> {
        let mut out = Vec::new();
        if self.segments.is_empty() {
            return out;
        }
        let (start, prefix) = if self.absolute {
            (PathBuf::from("/"), "/".to_string())
        } else {
            (base_dir.to_path_buf(), String::new())
        };
        walk(&start, prefix, &self.segments, None, options, &mut out);
        out
    }
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> bool {
    match segments.split_first() {
        None => parts.is_empty(),
        Some((Segment::Literal(l), rest)) => {
            parts.first().is_some_and(|p| p == l) && match_segments(rest, &parts[1..])
        }
        Some((Segment::Pattern(p), rest)) => {
            parts.first().is_some_and(|q| segment_match(p, q)) && match_segments(rest, &parts[1..])
        }
        Some((Segment::AnyLevel, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Filesystem expansion
// ═══════════════════════════════════════════════════════════════════════════════

/// A file produced by expanding a glob.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobMatch {
    /// The matched path, in the pattern's flavor with `/` separators.
    pub include: String,
    /// The segments a `**` consumed, with a trailing `/`, or empty.
    pub recursive_dir: String,
}

/// Filters applied while expanding a glob.
#[derive(Default)]
pub struct ExpandOptions<'a> {
    /// Exclude patterns applied to each produced include string.
    pub excludes: Option<&'a ExcludeSet>,
    /// Directories pruned during the walk.
    pub directory_excludes: Option<&'a DirectoryExcludes>,
}

fn walk(
    dir: &Path,
    prefix: String,
    segments: &[Segment],
    recursive_start: Option<usize>,
    options: &ExpandOptions<'_>,
    out: &mut Vec<GlobMatch>,
) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    // The last segment names files; everything before it navigates
    // directories.
    if rest.is_empty() {
        match head {
            Segment::AnyLevel => {}
            Segment::Literal(name) => {
                let path = dir.join(name);
                if path.is_file() {
                    push_match(&prefix, name, recursive_start, options, out);
                }
                return;
            }
            Segment::Pattern(pattern) => {
                for name in sorted_entries(dir, EntryKind::File) {
                    if segment_match(pattern, &name) {
                        push_match(&prefix, &name, recursive_start, options, out);
                    }
                }
                return;
            }
        }
    }

    match head {
        Segment::Literal(name) if name == "." => {
            walk(dir, prefix, rest, recursive_start, options, out);
        }
        Segment::Literal(name) if name == ".." => {
            let mut prefix = prefix;
            prefix.push_str("../");
            walk(&dir.join(".."), prefix, rest, recursive_start, options, out);
        }
        Segment::Literal(name) => {
            let sub = dir.join(name);
            if sub.is_dir() && !pruned(&prefix, name, options) {
                let mut prefix = prefix;
                prefix.push_str(name);
                prefix.push('/');
                walk(&sub, prefix, rest, recursive_start, options, out);
            }
        }
        Segment::Pattern(pattern) => {
            for name in sorted_entries(dir, EntryKind::Dir) {
                if segment_match(pattern, &name) && !pruned(&prefix, &name, options) {
                    let mut prefix = prefix.clone();
                    prefix.push_str(&name);
                    prefix.push('/');
                    walk(&dir.join(&name), prefix, rest, recursive_start, options, out);
                }
            }
        }
        Segment::AnyLevel => {
            let start = recursive_start.or(Some(prefix.len()));
            // Zero directories consumed first, then each subdirectory with
            // the `**` still pending.
            walk(dir, prefix.clone(), rest, start, options, out);
            for name in sorted_entries(dir, EntryKind::Dir) {
                if pruned(&prefix, &name, options) {
                    continue;
                }
                let mut prefix = prefix.clone();
                prefix.push_str(&name);
                prefix.push('/');
                walk(&dir.join(&name), prefix, segments, start, options, out);
            }
        }
    }
}

fn push_match(
    prefix: &str,
    name: &str,
    recursive_start: Option<usize>,
    options: &ExpandOptions<'_>,
    out: &mut Vec<GlobMatch>,
) {
    let include = format!("{prefix}{name}");
    if let Some(excludes) = options.excludes {
        if excludes.matches(&include) {
            return;
        }
    }
    let recursive_dir = recursive_start.map(|i| prefix[i..].to_string()).unwrap_or_default();
    out.push(GlobMatch { include, recursive_dir });
}

fn pruned(prefix: &str, name: &str, options: &ExpandOptions<'_>) -> bool {
    options
        .directory_excludes
        .is_some_and(|d| d.matches(&format!("{prefix}{name}")))
}

enum EntryKind {
    File,
    Dir,
}

fn sorted_entries(dir: &Path, kind: EntryKind) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| {
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            match kind {
                EntryKind::File => !is_dir,
                EntryKind::Dir => is_dir,
            }
        })
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Exclude sets
// ═══════════════════════════════════════════════════════════════════════════════

/// A compiled `Exclude` (or accumulated `Remove`) spec: a `;`-separated list
/// of patterns, any of which rejects a path.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    globs: Vec<CompiledGlob>,
}

impl ExcludeSet {
    pub fn new(spec: &str) -> Self {
        Self { globs: split_list(spec).map(CompiledGlob::compile).collect() }
    }

    /// Add another pattern list to the set.
    pub fn add(&mut self, spec: &str) {
        self.globs.extend(split_list(spec).map(CompiledGlob::compile));
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.globs.iter().any(|g| g.matches(path))
    }
}

/// Directory prune patterns, taken from exclude entries of the shape
/// `dir/**`: whole subtrees that the walk never enters.
#[derive(Debug, Clone, Default)]
pub struct DirectoryExcludes {
    globs: Vec<CompiledGlob>,
}

impl DirectoryExcludes {
    /// Extract the prunable entries of an exclude spec.
    pub fn from_exclude_spec(spec: &str) -> Self {
        let globs = split_list(spec)
            .filter_map(|p| {
                let p = normalize_slashes(p);
                p.strip_suffix("/**").map(CompiledGlob::compile)
            })
            .collect();
        Self { globs }
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    /// Test a directory path (relative to the walk root, no trailing slash).
    pub fn matches(&self, dir: &str) -> bool {
        self.globs.iter().any(|g| g.matches(dir))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn includes(matches: &[GlobMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.include.as_str()).collect()
    }

    // ── Segment matching ─────────────────────────────────────────────────

    #[test]
    fn segment_wildcards() {
        assert!(segment_match("*.cs", "main.cs"));
        assert!(segment_match("*.cs", ".cs"));
        assert!(!segment_match("*.cs", "main.fs"));
        assert!(segment_match("a?c", "abc"));
        assert!(!segment_match("a?c", "ac"));
        assert!(segment_match("*", "anything"));
        assert!(segment_match("a*b*c", "axxbyyc"));
        assert!(!segment_match("a*b*c", "axxbyy"));
    }

    #[test]
    fn segment_match_is_case_sensitive() {
        assert!(!segment_match("*.cs", "MAIN.CS"));
    }

    // ── Compilation and path matching ────────────────────────────────────

    #[test]
    fn compile_segments() {
        let glob = CompiledGlob::compile("src\\**\\*.cs");
        assert_eq!(
            glob.segments,
            vec![
                Segment::Literal("src".into()),
                Segment::AnyLevel,
                Segment::Pattern("*.cs".into()),
            ]
        );
    }

    #[test]
    fn trailing_recursive_matches_everything_below() {
        let glob = CompiledGlob::compile("obj/**");
        assert!(glob.matches("obj/debug/a.dll"));
        assert!(glob.matches("obj/x"));
        assert!(!glob.matches("src/a.cs"));
    }

    #[test]
    fn any_level_spans_zero_or_more() {
        let glob = CompiledGlob::compile("src/**/*.cs");
        assert!(glob.matches("src/a.cs"));
        assert!(glob.matches("src/x/y/a.cs"));
        assert!(!glob.matches("other/a.cs"));
    }

    #[test]
    fn absolute_patterns_match_absolute_paths_only() {
        let glob = CompiledGlob::compile("/opt/sdk/*.props");
        assert!(glob.matches("/opt/sdk/a.props"));
        assert!(!glob.matches("opt/sdk/a.props"));
    }

    // ── Filesystem expansion ─────────────────────────────────────────────

    fn tree(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            let path = dir.path().join(f);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, "").unwrap();
        }
        dir
    }

    #[test]
    fn expand_recursive_sorted() {
        let dir = tree(&["a.cs", "sub/b.cs", "sub/deep/c.cs", "notes.txt"]);
        let matches =
            CompiledGlob::compile("**/*.cs").expand(dir.path(), &ExpandOptions::default());
        assert_eq!(includes(&matches), vec!["a.cs", "sub/b.cs", "sub/deep/c.cs"]);
    }

    #[test]
    fn expand_records_recursive_dir() {
        let dir = tree(&["a.cs", "sub/deep/c.cs"]);
        let matches =
            CompiledGlob::compile("**/*.cs").expand(dir.path(), &ExpandOptions::default());
        let dirs: Vec<&str> = matches.iter().map(|m| m.recursive_dir.as_str()).collect();
        assert_eq!(dirs, vec!["", "sub/deep/"]);
    }

    #[test]
    fn expand_with_literal_prefix() {
        let dir = tree(&["a.cs", "src/b.cs", "src/nested/c.cs"]);
        let matches =
            CompiledGlob::compile("src/**/*.cs").expand(dir.path(), &ExpandOptions::default());
        assert_eq!(includes(&matches), vec!["src/b.cs", "src/nested/c.cs"]);
        assert_eq!(matches[1].recursive_dir, "nested/");
    }

    #[test]
    fn expand_applies_excludes() {
        let dir = tree(&["a.cs", "sub/b.cs", "sub/deep/c.cs"]);
        let excludes = ExcludeSet::new("sub/**");
        let options = ExpandOptions { excludes: Some(&excludes), directory_excludes: None };
        let matches = CompiledGlob::compile("**/*.cs").expand(dir.path(), &options);
        assert_eq!(includes(&matches), vec!["a.cs"]);
    }

    #[test]
    fn expand_prunes_excluded_directories() {
        let dir = tree(&["a.cs", "obj/junk.cs", "obj/deep/more.cs"]);
        let prune = DirectoryExcludes::from_exclude_spec("obj/**;*.tmp");
        let options = ExpandOptions { excludes: None, directory_excludes: Some(&prune) };
        let matches = CompiledGlob::compile("**/*.cs").expand(dir.path(), &options);
        assert_eq!(includes(&matches), vec!["a.cs"]);
    }

    #[test]
    fn expand_single_star_stays_flat() {
        let dir = tree(&["a.cs", "b.cs", "sub/c.cs"]);
        let matches = CompiledGlob::compile("*.cs").expand(dir.path(), &ExpandOptions::default());
        assert_eq!(includes(&matches), vec!["a.cs", "b.cs"]);
    }

    #[test]
    fn expand_parent_navigation() {
        let dir = tree(&["proj/x.csproj", "shared/common.cs"]);
        let base = dir.path().join("proj");
        let matches =
            CompiledGlob::compile("../shared/*.cs").expand(&base, &ExpandOptions::default());
        assert_eq!(includes(&matches), vec!["../shared/common.cs"]);
    }

    #[test]
    fn expand_question_mark() {
        let dir = tree(&["a1.cs", "a22.cs"]);
        let matches = CompiledGlob::compile("a?.cs").expand(dir.path(), &ExpandOptions::default());
        assert_eq!(includes(&matches), vec!["a1.cs"]);
    }

    // ── Exclude sets ─────────────────────────────────────────────────────

    #[test]
    fn exclude_set_accumulates() {
        let mut set = ExcludeSet::new("obj/**");
        set.add("*.bak");
        assert!(set.matches("obj/a.dll"));
        assert!(set.matches("file.bak"));
        assert!(!set.matches("src/a.cs"));
    }

    #[test]
    fn directory_excludes_only_take_subtree_patterns() {
        let prune = DirectoryExcludes::from_exclude_spec("obj/**;single.cs");
        assert!(prune.matches("obj"));
        assert!(!prune.matches("single.cs"));
    }
}
