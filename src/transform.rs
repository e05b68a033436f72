//! Item transforms: `@(Item)`, `@(Item->'expr')`, `@(Item->Function(...))`.
//!
//! A transform expression names an item type and optionally a body after
//! `->`.  The body is either a quoted per-item expression (evaluated once
//! per item with `%(...)` bound to it) or a function call.  Functions come
//! in three tiers:
//!
//! - summary: collapse the whole list to one value (`Count`,
//!   `AnyHaveMetadataValue`)
//! - list: produce a new item list (`Reverse`, `Distinct`, `ClearMetadata`,
//!   `HasMetadata`, `WithMetadataValue`, `DistinctWithCase`)
//! - per-item: compute one string per item (`DirectoryName`, `Metadata`,
//!   and any of the string functions applied to the include)
//!
//! The same string-function registry backs `$(Prop.Fn(...))` member calls.

use std::path::Path;

use crate::context::{split_call_args, unquote, EvaluationContext, ItemScope};
use crate::evaluated::EvaluatedItem;

// ═══════════════════════════════════════════════════════════════════════════════
//  Parsing
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed `@(...)` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformSpec {
    /// The item type named before `->`.
    pub item_name: String,
    pub kind: TransformKind,
}

/// The body of a transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformKind {
    /// `@(Item)`: the items themselves.
    Copy,
    /// `@(Item->'expr')`: a per-item expression.
    Expression(String),
    /// `@(Item->Fn(args))`: a known function; `args` is the raw argument
    /// text, unsplit.
    Function { name: String, args: String },
}

/// Parse a complete `@(...)` reference.  Returns `None` when the text is not
/// a single well-formed item reference, or names an unknown function.
pub fn parse_transform(text: &str) -> Option<TransformSpec> {
    let text = text.trim();
    let rest = text.strip_prefix("@(")?;
    let chars: Vec<char> = text.chars().collect();
    if crate::condition::matching_paren(&chars, 1) != Some(chars.len() - 1) {
        return None;
    }
    let inner = &rest[..rest.len() - 1];

    let Some(arrow) = find_arrow(inner) else {
        let item_name = inner.trim();
        if item_name.is_empty() {
            return None;
        }
        return Some(TransformSpec { item_name: item_name.to_string(), kind: TransformKind::Copy });
    };

    let item_name = inner[..arrow].trim();
    let body = inner[arrow + 2..].trim();
    if item_name.is_empty() || body.is_empty() {
        return None;
    }

    let kind = if body.starts_with('\'') && body.ends_with('\'') && body.len() >= 2 {
        TransformKind::Expression(body[1..body.len() - 1].to_string())
    } else if let Some((name, args)) = parse_function_call(body) {
        if !is_known_function(name) {
            return None;
        }
        TransformKind::Function { name: name.to_string(), args: args.to_string() }
    } else {
        // Unquoted expression form, e.g. `@(Compile->%(Filename))`.
        TransformKind::Expression(body.to_string())
    };

    Some(TransformSpec { item_name: item_name.to_string(), kind })
}

/// Position of the first `->` outside quotes.
fn find_arrow(s: &str) -> Option<usize> {
    let b = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i + 1 < b.len() {
        match b[i] {
            q @ (b'\'' | b'"') => {
                if quote == Some(q) {
                    quote = None;
                } else if quote.is_none() {
                    quote = Some(q);
                }
            }
            b'-' if quote.is_none() && b[i + 1] == b'>' => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split `Name(args)` into its parts, requiring balanced outer parens.
fn parse_function_call(s: &str) -> Option<(&str, &str)> {
    let open = s.find('(')?;
    if !s.ends_with(')') {
        return None;
    }
    let name = s[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((name, &s[open + 1..s.len() - 1]))
}

const SUMMARY_FUNCTIONS: &[&str] = &["Count", "AnyHaveMetadataValue"];
const LIST_FUNCTIONS: &[&str] = &[
    "Reverse",
    "HasMetadata",
    "WithMetadataValue",
    "ClearMetadata",
    "Distinct",
    "DistinctWithCase",
];
const ITEM_FUNCTIONS: &[&str] = &["DirectoryName", "Metadata"];

fn is_known_function(name: &str) -> bool {
    SUMMARY_FUNCTIONS.contains(&name)
        || LIST_FUNCTIONS.contains(&name)
        || ITEM_FUNCTIONS.contains(&name)
        || is_string_function(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Execution
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of running a transform over a matched item list.
#[derive(Debug)]
pub enum TransformResult {
    /// A summary function collapsed the list to a single value.
    Summary(String),
    /// A list function produced a new item list.  `ignore_metadata` is set
    /// by the functions that strip metadata (`ClearMetadata`, `Distinct`,
    /// `DistinctWithCase`).
    Items { items: Vec<EvaluatedItem>, ignore_metadata: bool },
    /// A per-item body produced one value per source item.
    PerItem(Vec<(String, EvaluatedItem)>),
}

/// Run a transform over `items` (already filtered to the spec's item type).
/// Returns `None` when the function or its arguments are invalid; a
/// per-item function that yields no value for an item drops that item.
pub fn execute_transform(
    items: &[EvaluatedItem],
    spec: &TransformSpec,
    ctx: &EvaluationContext,
    base_directory: &Path,
) -> Option<TransformResult> {
    match &spec.kind {
        TransformKind::Copy => Some(TransformResult::Items {
            items: items.to_vec(),
            ignore_metadata: false,
        }),
        TransformKind::Expression(expr) => {
            let values = items
                .iter()
                .map(|item| {
                    let scope = ItemScope { item, base_directory };
                    (ctx.evaluate_with(expr, Some(&scope)).text, item.clone())
                })
                .collect();
            Some(TransformResult::PerItem(values))
        }
        TransformKind::Function { name, args } => {
            let args: Vec<String> = split_call_args(args)
                .into_iter()
                .map(|a| ctx.evaluate(&unquote(a.trim())).text)
                .collect();
            if SUMMARY_FUNCTIONS.contains(&name.as_str()) {
                apply_summary_function(items, name, &args).map(TransformResult::Summary)
            } else if LIST_FUNCTIONS.contains(&name.as_str()) {
                apply_list_function(items, name, &args)
                    .map(|(items, ignore_metadata)| TransformResult::Items { items, ignore_metadata })
            } else {
                // Per-item functions skip items they cannot produce a value
                // for, e.g. `Metadata(...)` over an item lacking that
                // metadata.
                let values = items
                    .iter()
                    .filter_map(|item| {
                        apply_item_function(item, name, &args, base_directory)
                            .map(|v| (v, item.clone()))
                    })
                    .collect();
                Some(TransformResult::PerItem(values))
            }
        }
    }
}

/// Run a transform and join the outcome into a single `;`-separated string,
/// the way `@(...)` embedded in property or attribute text behaves.
pub fn execute_string_transform(
    items: &[EvaluatedItem],
    spec: &TransformSpec,
    ctx: &EvaluationContext,
    base_directory: &Path,
) -> Option<String> {
    Some(match execute_transform(items, spec, ctx, base_directory)? {
        TransformResult::Summary(value) => value,
        TransformResult::Items { items, .. } => {
            items.iter().map(|i| i.include.as_str()).collect::<Vec<_>>().join(";")
        }
        TransformResult::PerItem(values) => {
            values.iter().map(|(v, _)| v.as_str()).collect::<Vec<_>>().join(";")
        }
    })
}

fn apply_summary_function(
    items: &[EvaluatedItem],
    name: &str,
    args: &[String],
) -> Option<String> {
    match name {
        "Count" => Some(items.len().to_string()),
        "AnyHaveMetadataValue" => {
            let meta = args.first()?;
            let value = args.get(1)?;
            let any = items
                .iter()
                .any(|i| i.metadata_value(meta).is_some_and(|v| v.eq_ignore_ascii_case(value)));
            Some(if any { "true" } else { "false" }.to_string())
        }
        _ => None,
    }
}

fn apply_list_function(
    items: &[EvaluatedItem],
    name: &str,
    args: &[String],
) -> Option<(Vec<EvaluatedItem>, bool)> {
    match name {
        "Reverse" => Some((items.iter().rev().cloned().collect(), false)),
        "HasMetadata" => {
            let meta = args.first()?;
            Some((items.iter().filter(|i| i.has_metadata(meta)).cloned().collect(), false))
        }
        "WithMetadataValue" => {
            let meta = args.first()?;
            let value = args.get(1)?;
            let filtered = items
                .iter()
                .filter(|i| i.metadata_value(meta).is_some_and(|v| v.eq_ignore_ascii_case(value)))
                .cloned()
                .collect();
            Some((filtered, false))
        }
        "ClearMetadata" => Some((items.to_vec(), true)),
        "Distinct" | "DistinctWithCase" => {
            let case_sensitive = name == "DistinctWithCase";
            let mut seen: Vec<String> = Vec::new();
            let mut out = Vec::new();
            for item in items {
                let key = if case_sensitive {
                    item.include.clone()
                } else {
                    item.include.to_ascii_lowercase()
                };
                if !seen.contains(&key) {
                    seen.push(key);
                    out.push(item.clone());
                }
            }
            Some((out, true))
        }
        _ => None,
    }
}

fn apply_item_function(
    item: &EvaluatedItem,
    name: &str,
    args: &[String],
    base_directory: &Path,
) -> Option<String> {
    match name {
        "DirectoryName" => {
            let full = item.well_known_metadata("FullPath", base_directory)?;
            let slash = full.rfind('/')?;
            Some(full[..slash].to_string())
        }
        "Metadata" => {
            let meta = args.first()?;
            item.metadata_or_well_known(meta, base_directory)
        }
        _ => apply_string_function(&item.include, name, args),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  String functions
// ═══════════════════════════════════════════════════════════════════════════════

fn is_string_function(name: &str) -> bool {
    matches!(
        name,
        "ToUpper"
            | "ToLower"
            | "Trim"
            | "TrimStart"
            | "TrimEnd"
            | "Replace"
            | "Substring"
            | "Contains"
            | "StartsWith"
            | "EndsWith"
            | "IndexOf"
            | "PadLeft"
            | "PadRight"
            | "Length"
    )
}

/// Apply one of the supported string functions.  Returns `None` for unknown
/// names, missing arguments or out-of-range indexes.
pub fn apply_string_function(value: &str, name: &str, args: &[String]) -> Option<String> {
    let arg = |i: usize| args.get(i).map(String::as_str);
    match name {
        "ToUpper" => Some(value.to_uppercase()),
        "ToLower" => Some(value.to_lowercase()),
        "Trim" => Some(trim_with(value, arg(0), str::trim, |v, set| {
            v.trim_matches(|c| set.contains(c))
        })),
        "TrimStart" => Some(trim_with(value, arg(0), str::trim_start, |v, set| {
            v.trim_start_matches(|c| set.contains(c))
        })),
        "TrimEnd" => Some(trim_with(value, arg(0), str::trim_end, |v, set| {
            v.trim_end_matches(|c| set.contains(c))
        })),
        "Replace" => Some(value.replace(arg(0)?, arg(1)?)),
        "Substring" => {
            let chars: Vec<char> = value.chars().collect();
            let start: usize = arg(0)?.trim().parse().ok()?;
            let end = match arg(1) {
                Some(len) => start.checked_add(len.trim().parse().ok()?)?,
                None => chars.len(),
            };
            if start > chars.len() || end > chars.len() {
                return None;
            }
            Some(chars[start..end].iter().collect())
        }
        "Contains" => Some(bool_text(value.contains(arg(0)?))),
        "StartsWith" => Some(bool_text(value.starts_with(arg(0)?))),
        "EndsWith" => Some(bool_text(value.ends_with(arg(0)?))),
        "IndexOf" => {
            let needle = arg(0)?;
            let index = value
                .find(needle)
                .map(|i| value[..i].chars().count() as i64)
                .unwrap_or(-1);
            Some(index.to_string())
        }
        "PadLeft" | "PadRight" => {
            let width: usize = arg(0)?.trim().parse().ok()?;
            let pad = arg(1).and_then(|s| s.chars().next()).unwrap_or(' ');
            let len = value.chars().count();
            if len >= width {
                return Some(value.to_string());
            }
            let fill: String = std::iter::repeat(pad).take(width - len).collect();
            Some(if name == "PadLeft" {
                format!("{fill}{value}")
            } else {
                format!("{value}{fill}")
            })
        }
        "Length" => Some(value.chars().count().to_string()),
        _ => None,
    }
}

fn trim_with(
    value: &str,
    set: Option<&str>,
    plain: impl for<'a> Fn(&'a str) -> &'a str,
    with_set: impl for<'a> Fn(&'a str, &'a str) -> &'a str,
) -> String {
    match set {
        Some(set) if !set.is_empty() => with_set(value, set).to_string(),
        _ => plain(value).to_string(),
    }
}

fn bool_text(b: bool) -> String {
    if b { "True" } else { "False" }.to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
