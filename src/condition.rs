//! MSBuild condition parser and evaluator.
//!
//! Parses and evaluates `Condition` attributes, for example:
//!
//! - `'$(Configuration)'=='Debug' And '$(Platform)'=='Win32'`
//! - `('$(Platform)'=='x64' and '$(Optimize)'=='true') or '$(Retail)'!=''`
//! - `Exists('$(MSBuildThisFileDirectory)custom.targets')`
//! - `!HasTrailingSlash('$(OutDir)') or $(WarningLevel) &gt; 2`
//!
//! Uses [`chumsky`] for the parsing grammar.  Parsed expressions are cached
//! process-wide, since the same condition strings recur across every project
//! that imports the same `.props`/`.targets` files.
//!
//! ## Grammar (case-insensitive keywords and function names)
//!
//! ```text
//! expr       = or_expr
//! or_expr    = and_expr ('or' and_expr)*
//! and_expr   = atom ('and' atom)*
//! atom       = comparison | function | '!' atom | '(' expr ')' | operand
//! comparison = operand op operand
//! op         = '==' | '!=' | '<=' | '>=' | '<' | '>'
//! function   = ('Exists' | 'HasTrailingSlash') '(' operand ')'
//! operand    = "'" chars "'" | bare-text
//! ```
//!
//! Evaluation needs a [`ConditionScope`] to resolve `$(Property)` references
//! and embedded `%(...)`/`@(...)` expressions, and returns
//! `Result<bool, ConditionError>`.  Callers that want MSBuild's fail-safe
//! behavior (a condition that cannot be parsed or evaluated counts as false)
//! coerce the error themselves, so the decision to swallow an error is always
//! visible at the call site.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chumsky::prelude::*;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
//  AST
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `lhs op rhs`.
    Compare {
        lhs: Operand,
        op: CompareOp,
        rhs: Operand,
    },
    /// `a and b` (case-insensitive keyword).
    And(Box<Condition>, Box<Condition>),
    /// `a or b` (case-insensitive keyword).
    Or(Box<Condition>, Box<Condition>),
    /// `!a`.
    Not(Box<Condition>),
    /// `Exists('path')` or `HasTrailingSlash('$(Dir)')`.
    Call { function: CallFunction, arg: Operand },
    /// A bare operand used as a boolean, e.g. `$(BuildTests)` or `true`.
    Truth(Operand),
}

/// Comparison operator used inside a [`Condition::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `<=`
    LessEq,
    /// `>=`
    GreaterEq,
}

/// Built-in condition functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFunction {
    /// `Exists(path)`: file or directory existence, relative to the scope's
    /// base directory.
    Exists,
    /// `HasTrailingSlash(text)`.
    HasTrailingSlash,
}

/// An operand: a sequence of literal and expandable fragments.
pub type Operand = Vec<TextPart>;

/// A fragment of an operand.
#[derive(Debug, Clone, PartialEq)]
pub enum TextPart {
    /// Literal text (no expansion needed).
    Literal(String),
    /// A plain `$(PropertyName)` reference.
    Property(String),
    /// Any other embedded expression kept verbatim, including the sigil:
    /// `%(Metadata)`, `@(Item)`, `$(Prop.ToUpper())`.  Expanded through
    /// [`ConditionScope::expand`].
    Expand(String),
}

/// Errors from parsing or evaluating a condition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConditionError {
    #[error("failed to parse condition '{input}': {message}")]
    Parse { input: String, message: String },
    #[error("'{value}' cannot be compared numerically")]
    NotNumeric { value: String },
    #[error("'{value}' is not a boolean value")]
    NotBoolean { value: String },
}

/// Resolves the dynamic pieces of a condition during evaluation.
pub trait ConditionScope {
    /// Value of a plain `$(name)` reference, or `None` if undefined.
    fn property(&self, name: &str) -> Option<String>;

    /// Expand an embedded expression kept verbatim by the parser
    /// (`%(...)`, `@(...)`, `$(Prop.Fn())`).
    fn expand(&self, raw: &str) -> String;

    /// Base directory that relative `Exists(...)` paths resolve against.
    fn base_directory(&self) -> Option<&Path>;
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Text-part splitting
// ═══════════════════════════════════════════════════════════════════════════════

/// Split raw operand text into [`TextPart`] fragments.
///
/// A plain `$(Name)` becomes [`TextPart::Property`]; `$(...)` with anything
/// other than a property name inside, and all `%(...)`/`@(...)` expressions,
/// stay verbatim as [`TextPart::Expand`].  Parentheses inside an expression
/// must balance; an unterminated expression is treated as literal text.
fn parse_text_parts(s: &str) -> Operand {
    let chars: Vec<char> = s.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if (c == '$' || c == '%' || c == '@') && chars.get(i + 1) == Some(&'(') {
            if let Some(end) = matching_paren(&chars, i + 1) {
                if !literal.is_empty() {
                    parts.push(TextPart::Literal(std::mem::take(&mut literal)));
                }
                let inner: String = chars[i + 2..end].iter().collect();
                if c == '$' && is_property_name(&inner) {
                    parts.push(TextPart::Property(inner));
                } else {
                    parts.push(TextPart::Expand(chars[i..=end].iter().collect()));
                }
                i = end + 1;
                continue;
            }
        }
        literal.push(c);
        i += 1;
    }

    if !literal.is_empty() {
        parts.push(TextPart::Literal(literal));
    }

    parts
}

/// Index of the `)` matching the `(` at `open`, honoring nesting.
pub(crate) fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn is_property_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Chumsky parser
// ═══════════════════════════════════════════════════════════════════════════════

/// Build the chumsky parser for condition expressions.
fn condition_parser<'a>() -> impl Parser<'a, &'a str, Condition, extra::Err<Simple<'a, char>>> {
    recursive(|expr| {
        // ── Single-quoted operand ────────────────────────────────────────
        let quoted = just('\'')
            .ignore_then(none_of('\'').repeated().to_slice())
            .then_ignore(just('\''))
            .map(parse_text_parts);

        // ── Bare operand ─────────────────────────────────────────────────
        // Unquoted text such as `true`, `3`, `$(WarningLevel)` or
        // `@(Compile->Count())`.  A `$`/`%`/`@` sigil may be followed by a
        // balanced parenthesized group; outside of those groups the operand
        // stops at whitespace, quotes, parentheses and operator characters.
        let bare = {
            let group = recursive(|group| {
                just('(')
                    .then(none_of("()").ignored().or(group.ignored()).repeated())
                    .then(just(')'))
                    .ignored()
            });
            let raw_char = none_of(" \t\r\n'()<>=!,").ignored();
            one_of("$%@")
                .ignored()
                .then_ignore(group)
                .or(raw_char)
                .repeated()
                .at_least(1)
                .to_slice()
                .map(parse_text_parts)
        };

        let operand = quoted.or(bare);

        // ── Comparison operators ─────────────────────────────────────────
        let cmp_op = choice((
            just("==").to(CompareOp::Equal),
            just("!=").to(CompareOp::NotEqual),
            just("<=").to(CompareOp::LessEq),
            just(">=").to(CompareOp::GreaterEq),
            just('<').to(CompareOp::Less),
            just('>').to(CompareOp::Greater),
        ));

        // ── Comparison:  lhs op rhs ──────────────────────────────────────
        let comparison = operand
            .clone()
            .padded()
            .then(cmp_op.padded())
            .then(operand.clone().padded())
            .map(|((lhs, op), rhs)| Condition::Compare { lhs, op, rhs });

        // ── Case-insensitive alphabetic word (for keyword matching) ──────
        let alpha_word = any()
            .filter(|c: &char| c.is_ascii_alphabetic())
            .repeated()
            .at_least(1)
            .to_slice();

        // ── Exists('path') / HasTrailingSlash('text') ────────────────────
        let function = alpha_word
            .filter(|s: &&str| {
                s.eq_ignore_ascii_case("exists") || s.eq_ignore_ascii_case("hastrailingslash")
            })
            .map(|s: &str| {
                if s.eq_ignore_ascii_case("exists") {
                    CallFunction::Exists
                } else {
                    CallFunction::HasTrailingSlash
                }
            })
            .then_ignore(just('(').padded())
            .then(operand.clone())
            .then_ignore(just(')').padded())
            .map(|(function, arg)| Condition::Call { function, arg });

        // ── Atom: recursive so '!' binds tighter than 'and'/'or' ─────────
        let atom = recursive(|atom| {
            let paren_expr = expr.delimited_by(just('(').padded(), just(')').padded());

            let not = just('!')
                .padded()
                .ignore_then(atom)
                .map(|c| Condition::Not(Box::new(c)));

            let truth = operand.clone().map(Condition::Truth);

            choice((comparison, function, not, paren_expr, truth)).padded()
        });

        // ── 'and', higher precedence than 'or' ──────────────────────────
        let and_kw = alpha_word
            .filter(|s: &&str| s.eq_ignore_ascii_case("and"))
            .padded();

        let and_expr = atom.clone().foldl(and_kw.ignore_then(atom).repeated(), |lhs, rhs| {
            Condition::And(Box::new(lhs), Box::new(rhs))
        });

        // ── 'or', lowest precedence ─────────────────────────────────────
        let or_kw = alpha_word
            .filter(|s: &&str| s.eq_ignore_ascii_case("or"))
            .padded();

        and_expr.clone().foldl(or_kw.ignore_then(and_expr).repeated(), |lhs, rhs| {
            Condition::Or(Box::new(lhs), Box::new(rhs))
        })
    })
}

// Parsed conditions, keyed by their exact source text.  Only successful
// parses are cached; failures stay cheap to re-report and are rare.
static PARSE_CACHE: Lazy<RwLock<HashMap<String, Arc<Condition>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Parse a condition attribute string into a [`Condition`] AST.
///
/// Results are cached process-wide and shared via [`Arc`].
pub fn parse_condition(input: &str) -> Result<Arc<Condition>, ConditionError> {
    if let Some(cached) = PARSE_CACHE.read().get(input) {
        return Ok(cached.clone());
    }

    let parsed = condition_parser()
        .parse(input)
        .into_result()
        .map_err(|errs| {
            let messages: Vec<String> = errs.iter().map(|e| format!("{e}")).collect();
            ConditionError::Parse {
                input: input.to_string(),
                message: messages.join("; "),
            }
        })?;

    Ok(PARSE_CACHE
        .write()
        .entry(input.to_string())
        .or_insert_with(|| Arc::new(parsed))
        .clone())
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Evaluation
// ═══════════════════════════════════════════════════════════════════════════════

/// Expand an operand to its string value using the scope.
/// Undefined properties expand to the empty string.
fn expand_operand(parts: &Operand, scope: &dyn ConditionScope) -> String {
    parts
        .iter()
        .map(|part| match part {
            TextPart::Literal(s) => s.clone(),
            TextPart::Property(name) => scope.property(name).unwrap_or_default(),
            TextPart::Expand(raw) => scope.expand(raw),
        })
        .collect()
}

/// Evaluate a condition expression against a scope.
///
/// `and`/`or` short-circuit left to right.  Relational operators require
/// both operands to be numeric (decimal or `0x` hexadecimal); equality falls
/// back to case-insensitive string comparison when either side is not.
pub fn evaluate(cond: &Condition, scope: &dyn ConditionScope) -> Result<bool, ConditionError> {
    match cond {
        Condition::Compare { lhs, op, rhs } => {
            let l = expand_operand(lhs, scope);
            let r = expand_operand(rhs, scope);
            op.apply(&l, &r)
        }
        Condition::And(a, b) => Ok(evaluate(a, scope)? && evaluate(b, scope)?),
        Condition::Or(a, b) => Ok(evaluate(a, scope)? || evaluate(b, scope)?),
        Condition::Not(inner) => Ok(!evaluate(inner, scope)?),
        Condition::Call { function, arg } => {
            let value = expand_operand(arg, scope);
            match function {
                CallFunction::Exists => Ok(path_exists(&value, scope)),
                CallFunction::HasTrailingSlash => {
                    Ok(value.ends_with('/') || value.ends_with('\\'))
                }
            }
        }
        Condition::Truth(operand) => parse_bool(&expand_operand(operand, scope)),
    }
}

impl CompareOp {
    fn apply(self, l: &str, r: &str) -> Result<bool, ConditionError> {
        match self {
            CompareOp::Equal => Ok(values_equal(l, r)),
            CompareOp::NotEqual => Ok(!values_equal(l, r)),
            CompareOp::Less => numeric_pair(l, r).map(|(a, b)| a < b),
            CompareOp::Greater => numeric_pair(l, r).map(|(a, b)| a > b),
            CompareOp::LessEq => numeric_pair(l, r).map(|(a, b)| a <= b),
            CompareOp::GreaterEq => numeric_pair(l, r).map(|(a, b)| a >= b),
        }
    }
}

/// Numeric if both sides parse as numbers, case-insensitive string equality
/// otherwise.
fn values_equal(l: &str, r: &str) -> bool {
    match (parse_number(l), parse_number(r)) {
        (Some(a), Some(b)) => a == b,
        _ => l.eq_ignore_ascii_case(r),
    }
}

fn numeric_pair(l: &str, r: &str) -> Result<(f64, f64), ConditionError> {
    let a = parse_number(l).ok_or_else(|| ConditionError::NotNumeric { value: l.to_string() })?;
    let b = parse_number(r).ok_or_else(|| ConditionError::NotNumeric { value: r.to_string() })?;
    Ok((a, b))
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    s.parse::<f64>().ok()
}

fn parse_bool(value: &str) -> Result<bool, ConditionError> {
    let v = value.trim();
    if ["true", "yes", "on"].iter().any(|s| v.eq_ignore_ascii_case(s)) {
        Ok(true)
    } else if ["false", "no", "off"].iter().any(|s| v.eq_ignore_ascii_case(s)) {
        Ok(false)
    } else {
        Err(ConditionError::NotBoolean { value: v.to_string() })
    }
}

fn path_exists(value: &str, scope: &dyn ConditionScope) -> bool {
    let text = value.trim();
    if text.is_empty() {
        return false;
    }
    let path = PathBuf::from(text.replace('\\', "/"));
    let path = if path.is_relative() {
        match scope.base_directory() {
            Some(base) => base.join(path),
            None => path,
        }
    } else {
        path
    };
    path.exists()
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Conditioned properties
// ═══════════════════════════════════════════════════════════════════════════════

/// Property values observed in equality conditions, in first-seen order.
///
/// `'$(Configuration)'=='Debug'` records `Configuration = Debug`;
/// `'$(Configuration)|$(Platform)'=='Debug|x64'` records one value for each
/// property in the pair.  IDEs use this to enumerate the configurations and
/// platforms a project supports.
#[derive(Debug, Clone, Default)]
pub struct ConditionedProperties {
    values: IndexMap<String, Vec<String>>,
}

impl ConditionedProperties {
    /// Record `value` as a possible value of `property`, ignoring duplicates.
    pub fn add(&mut self, property: &str, value: &str) {
        let entries = self.values.entry(property.to_string()).or_default();
        if !entries.iter().any(|v| v == value) {
            entries.push(value.to_string());
        }
    }

    /// The recorded values of `property`, in first-seen order.
    pub fn property_values(&self, property: &str) -> Option<&[String]> {
        self.values.get(property).map(Vec::as_slice)
    }

    /// The properties seen so far, in first-seen order.
    pub fn properties(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge another collection into this one.
    pub fn merge(&mut self, other: &ConditionedProperties) {
        for (property, values) in &other.values {
            for value in values {
                self.add(property, value);
            }
        }
    }
}

/// Walk a condition and record the property/value pairs its equality
/// comparisons mention.
pub fn collect_conditioned_properties(cond: &Condition, props: &mut ConditionedProperties) {
    match cond {
        Condition::And(a, b) | Condition::Or(a, b) => {
            collect_conditioned_properties(a, props);
            collect_conditioned_properties(b, props);
        }
        Condition::Not(inner) => collect_conditioned_properties(inner, props),
        Condition::Compare { lhs, op: CompareOp::Equal, rhs } => {
            if !collect_pair(lhs, rhs, props) {
                collect_pair(rhs, lhs, props);
            }
        }
        _ => {}
    }
}

/// Try to record `properties == literals`; returns whether the shapes
/// matched.  Handles both `$(P)=='v'` and the `|`-joined multi-property form.
fn collect_pair(props_side: &Operand, value_side: &Operand, props: &mut ConditionedProperties) -> bool {
    let Some(value) = literal_text(value_side) else {
        return false;
    };

    // Property names, expecting `$(A)`, `$(A)|$(B)`, `$(A)|$(B)|$(C)`, ...
    let mut names = Vec::new();
    for (i, part) in props_side.iter().enumerate() {
        if i % 2 == 0 {
            match part {
                TextPart::Property(name) => names.push(name.as_str()),
                _ => return false,
            }
        } else {
            match part {
                TextPart::Literal(sep) if sep == "|" => {}
                _ => return false,
            }
        }
    }
    if names.is_empty() || props_side.len() % 2 == 0 {
        return false;
    }

    let values: Vec<&str> = value.split('|').collect();
    if values.len() != names.len() {
        return false;
    }

    for (name, value) in names.iter().zip(&values) {
        props.add(name, value);
    }
    true
}

fn literal_text(operand: &Operand) -> Option<String> {
    let mut text = String::new();
    for part in operand {
        match part {
            TextPart::Literal(s) => text.push_str(s),
            _ => return None,
        }
    }
    Some(text)
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
