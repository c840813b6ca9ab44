//! Named-parameter queries and bindvar rewriting.
//!
//! `INSERT INTO product (name, price) VALUES (:name, :price)` is compiled into the
//! driver's positional form plus the ordered list of names; values are then looked up in
//! a serialized argument (any `Serialize` struct or map). Dotted names such as
//! `:image.url` walk nested objects.
//!
//! Text inside single quotes, double quotes and backticks is copied verbatim, and `::`
//! is kept as-is so PostgreSQL casts (`:price::numeric`) keep working.

use crate::db::driver::BindStyle;
use crate::db::params::QueryParam;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// A named query compiled for one bindvar style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    sql: String,
    names: Vec<String>,
}

impl NamedQuery {
    /// Compile `sql` for `style`.
    pub fn compile(sql: &str, style: BindStyle) -> DbResult<Self> {
        let chars: Vec<char> = sql.chars().collect();
        let mut out = String::with_capacity(sql.len());
        let mut names = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '\'' | '"' | '`' => {
                    let end = quoted_end(&chars, i);
                    out.extend(&chars[i..end]);
                    i = end;
                }
                ':' if chars.get(i + 1) == Some(&':') => {
                    out.push_str("::");
                    i += 2;
                }
                ':' if chars.get(i + 1).is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len()
                        && (chars[end].is_ascii_alphanumeric()
                            || chars[end] == '_'
                            || chars[end] == '.')
                    {
                        end += 1;
                    }
                    // A trailing dot ends the sentence, not the name.
                    while end > start && chars[end - 1] == '.' {
                        end -= 1;
                    }
                    names.push(chars[start..end].iter().collect());
                    push_placeholder(&mut out, style, names.len());
                    i = end;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        if names.is_empty() {
            return Err(DbError::invalid_input(
                "named query has no :name parameters",
            ));
        }

        Ok(Self { sql: out, names })
    }

    pub(crate) fn from_parts(sql: String, names: Vec<String>) -> Self {
        Self { sql, names }
    }

    /// The compiled positional SQL.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter names in placeholder order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Resolve the positional parameters from a serializable argument.
    pub fn bind_args<T: Serialize + ?Sized>(&self, arg: &T) -> DbResult<Vec<QueryParam>> {
        let value = serde_json::to_value(arg)
            .map_err(|e| DbError::invalid_input(format!("unable to serialize argument: {e}")))?;
        if !value.is_object() {
            return Err(DbError::invalid_input(format!(
                "named query argument must be a struct or map, got {}",
                json_kind(&value)
            )));
        }
        self.names
            .iter()
            .map(|name| {
                lookup(&value, name).cloned().map(QueryParam::from).ok_or_else(|| {
                    DbError::invalid_input(format!("could not find name '{}' in argument", name))
                })
            })
            .collect()
    }
}

/// Rewrite `?` bindvars into the positional style of the driver.
pub fn rebind(sql: &str, style: BindStyle) -> String {
    if style == BindStyle::Question {
        return sql.to_string();
    }
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                let end = quoted_end(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '?' => {
                n += 1;
                push_placeholder(&mut out, style, n);
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// One positional argument of [`expand_in`].
#[derive(Debug, Clone, PartialEq)]
pub enum InArg {
    /// Binds to a single `?`.
    Value(QueryParam),
    /// Expands its `?` into one bindvar per element.
    List(Vec<QueryParam>),
}

impl InArg {
    pub fn value(value: impl Into<QueryParam>) -> Self {
        Self::Value(value.into())
    }

    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<QueryParam>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<QueryParam> for InArg {
    fn from(value: QueryParam) -> Self {
        Self::Value(value)
    }
}

/// Expand list arguments of a `?` query into one bindvar each, so
/// `id IN (?)` with three ids becomes `id IN (?, ?, ?)`. The result is written in
/// `style` and comes with the flattened parameters.
pub fn expand_in(
    sql: &str,
    args: &[InArg],
    style: BindStyle,
) -> DbResult<(String, Vec<QueryParam>)> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len() + 16);
    let mut params = Vec::with_capacity(args.len());
    let mut used = 0;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\'' | '"' | '`' => {
                let end = quoted_end(&chars, i);
                out.extend(&chars[i..end]);
                i = end;
            }
            '?' => {
                let arg = args.get(used).ok_or_else(|| {
                    DbError::invalid_input(format!(
                        "query has more bindvars than the {} arguments given",
                        args.len()
                    ))
                })?;
                used += 1;
                match arg {
                    InArg::Value(value) => {
                        params.push(value.clone());
                        push_placeholder(&mut out, style, params.len());
                    }
                    InArg::List(values) if values.is_empty() => {
                        return Err(DbError::invalid_input(format!(
                            "empty list passed for bindvar {}",
                            used
                        )));
                    }
                    InArg::List(values) => {
                        for (n, value) in values.iter().enumerate() {
                            if n > 0 {
                                out.push_str(", ");
                            }
                            params.push(value.clone());
                            push_placeholder(&mut out, style, params.len());
                        }
                    }
                }
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    if used < args.len() {
        return Err(DbError::invalid_input(format!(
            "query has {} bindvars but {} arguments were given",
            used,
            args.len()
        )));
    }
    Ok((out, params))
}

fn push_placeholder(out: &mut String, style: BindStyle, position: usize) {
    match style {
        BindStyle::Question => out.push('?'),
        BindStyle::Dollar => {
            out.push('$');
            out.push_str(&position.to_string());
        }
    }
}

/// Index just past the closing quote of the quoted run starting at `start`.
/// Doubled quotes (`'it''s'`) stay inside the run.
fn quoted_end(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .try_fold(value, |current, key| current.as_object()?.get(key))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
