//! DSL text utilities shared by the composition engine, the verb executor and
//! the built-in domains.
//!
//! ## Contents
//! - `parser`: nom-based S-expression reader
//! - [`DslForm`]: builder that renders a verb form with one parameter per line
//! - [`VerbForm`]: a parsed verb call with typed parameter accessors
//! - [`check_balance`]: grouping-marker validation that tolerates strings and
//!   comments

pub mod parser;

pub use parser::{parse_document, parse_single, LocatedForm, SExpr};

use crate::error::VerbError;

/// Quote and escape a string literal
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Verify that `(`/`)` and `[`/`]` balance, ignoring string contents and
/// `;` comments.
pub fn check_balance(text: &str) -> Result<(), String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut in_comment = false;
    let mut line = 1;

    for c in text.chars() {
        if c == '\n' {
            line += 1;
            in_comment = false;
            if !in_string {
                continue;
            }
        }
        if in_comment {
            continue;
        }
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            ';' => in_comment = true,
            '(' | '[' => stack.push((c, line)),
            ')' | ']' => {
                let expected = if c == ')' { '(' } else { '[' };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, open_line)) => {
                        return Err(format!(
                            "line {}: '{}' closes '{}' opened on line {}",
                            line, c, open, open_line
                        ))
                    }
                    None => return Err(format!("line {}: unexpected '{}'", line, c)),
                }
            }
            _ => {}
        }
    }

    if in_string {
        return Err("Unterminated string literal".to_string());
    }
    if let Some((_, open_line)) = stack.last() {
        return Err(format!(
            "Unmatched parentheses: {} unclosed, innermost opened on line {}",
            stack.len(),
            open_line
        ));
    }
    Ok(())
}

/// Builder for a rendered verb form
///
/// ```
/// use ob_orchestration::dsl::DslForm;
///
/// let dsl = DslForm::new("kyc.start")
///     .text("entity.name", "Acme Ltd")
///     .raw("priority", "3")
///     .render();
/// assert_eq!(dsl, "(kyc.start\n  (entity.name \"Acme Ltd\")\n  (priority 3))");
/// ```
#[derive(Debug, Clone, Default)]
pub struct DslForm {
    verb: String,
    params: Vec<(String, Vec<String>)>,
}

impl DslForm {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            params: Vec::new(),
        }
    }

    /// Quoted string parameter
    pub fn text(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.params
            .push((key.to_string(), vec![quote(value.as_ref())]));
        self
    }

    /// Quoted string parameter, skipped when absent
    pub fn optional_text(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.text(key, v),
            None => self,
        }
    }

    /// Several quoted strings under one key
    pub fn texts<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rendered = values.into_iter().map(|v| quote(v.as_ref())).collect();
        self.params.push((key.to_string(), rendered));
        self
    }

    /// Unquoted value (numbers, booleans, symbols, nested forms)
    pub fn raw(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), vec![value.into()]));
        self
    }

    pub fn raws(mut self, key: &str, values: Vec<String>) -> Self {
        self.params.push((key.to_string(), values));
        self
    }

    pub fn flag(self, key: &str, value: bool) -> Self {
        self.raw(key, value.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Multi-line rendering, two-space parameter indent
    pub fn render(&self) -> String {
        if self.params.is_empty() {
            return format!("({})", self.verb);
        }
        let lines: Vec<String> = self
            .params
            .iter()
            .map(|(key, values)| render_param(key, values))
            .collect();
        format!("({}\n  {})", self.verb, lines.join("\n  "))
    }

    /// Single-line rendering for nesting inside another form
    pub fn render_inline(&self) -> String {
        let mut parts = vec![self.verb.clone()];
        parts.extend(
            self.params
                .iter()
                .map(|(key, values)| render_param(key, values)),
        );
        format!("({})", parts.join(" "))
    }
}

fn render_param(key: &str, values: &[String]) -> String {
    if values.is_empty() {
        format!("({})", key)
    } else {
        format!("({} {})", key, values.join(" "))
    }
}

/// A parsed `(verb (key value ...) ...)` call
#[derive(Debug, Clone, PartialEq)]
pub struct VerbForm {
    pub verb: String,
    /// 1-based line the form starts on
    pub line: usize,
    pub params: Vec<(String, Vec<SExpr>)>,
}

impl VerbForm {
    pub fn from_expr(expr: &SExpr, line: usize) -> Result<Self, VerbError> {
        let items = match expr.as_list() {
            Some(items) if expr.head().is_some() => items,
            _ => {
                return Err(VerbError::NotAVerbForm {
                    line,
                    found: expr.render(),
                })
            }
        };

        let verb = items[0].as_symbol().unwrap_or_default().to_string();
        let mut params = Vec::new();
        for item in &items[1..] {
            match (item.head(), item.as_list()) {
                (Some(key), Some(values)) => params.push((key.to_string(), values[1..].to_vec())),
                _ => {
                    return Err(VerbError::InvalidParameter {
                        verb,
                        parameter: item.render(),
                        reason: "expected (key value ...)".to_string(),
                    })
                }
            }
        }

        Ok(Self { verb, line, params })
    }

    /// Parse every top-level form of a document
    pub fn parse_all(dsl: &str) -> Result<Vec<Self>, VerbError> {
        parse_document(dsl)?
            .iter()
            .map(|form| Self::from_expr(&form.expr, form.location.line))
            .collect()
    }

    pub fn has(&self, key: &str) -> bool {
        self.params.iter().any(|(k, _)| k == key)
    }

    /// Values of the first occurrence of `key`
    pub fn values(&self, key: &str) -> Option<&[SExpr]> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
    }

    /// Values of every occurrence of a repeatable key such as `stage`
    pub fn all(&self, key: &str) -> Vec<&[SExpr]> {
        self.params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
            .collect()
    }

    /// First scalar value of `key`
    pub fn text(&self, key: &str) -> Option<String> {
        self.values(key)
            .and_then(|values| values.first())
            .and_then(SExpr::atom_text)
    }

    /// Every scalar under `key`, flattening vectors
    pub fn texts(&self, key: &str) -> Vec<String> {
        self.values(key)
            .map(|values| values.iter().flat_map(SExpr::flatten_text).collect())
            .unwrap_or_default()
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.values(key).and_then(|values| values.first()) {
            Some(SExpr::Bool(b)) => Some(*b),
            Some(SExpr::Str(s)) | Some(SExpr::Symbol(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" => Some(true),
                "false" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values(key).and_then(|values| values.first()) {
            Some(SExpr::Number(n)) => Some(*n),
            Some(SExpr::Str(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Nested `(name value ...)` pairs under `key` as name -> flattened values
    pub fn pairs(&self, key: &str) -> Vec<(String, Vec<String>)> {
        self.values(key)
            .unwrap_or_default()
            .iter()
            .filter_map(|item| {
                let name = item.head()?.to_string();
                let values = item.as_list()?[1..]
                    .iter()
                    .flat_map(SExpr::flatten_text)
                    .collect();
                Some((name, values))
            })
            .collect()
    }

    /// Required keys that are absent
    pub fn missing(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|key| !self.has(key))
            .map(|key| key.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_balance_ignores_strings_and_comments() {
        assert!(check_balance("(a \"(\" ; )\n (b))").is_ok());
        assert!(check_balance("(a (b)").unwrap_err().contains("Unmatched parentheses"));
        assert!(check_balance("(a))").unwrap_err().contains("unexpected ')'"));
        assert!(check_balance("(a [b)]").is_err());
        assert!(check_balance("(a \"open)").is_err());
    }

    #[test]
    fn test_dsl_form_inline_nesting() {
        let stage = DslForm::new("stage")
            .texts("domains", ["kyc", "ubo"])
            .flag("parallel.execution", true)
            .render_inline();
        assert_eq!(
            stage,
            "(stage (domains \"kyc\" \"ubo\") (parallel.execution true))"
        );
        assert_eq!(DslForm::new("noop").render(), "(noop)");
    }

    #[test]
    fn test_verb_form_accessors() {
        let forms = VerbForm::parse_all(
            r#"(state.sync.attributes
  (attributes @attr{entity.name} @attr{entity.lei})
  (between.domains ["kyc" "ubo"])
  (validation.required true)
  (dependencies (ubo "kyc") (trading "custody")))"#,
        )
        .unwrap();
        let form = &forms[0];

        assert_eq!(form.verb, "state.sync.attributes");
        assert_eq!(form.texts("attributes"), vec!["entity.name", "entity.lei"]);
        assert_eq!(form.texts("between.domains"), vec!["kyc", "ubo"]);
        assert_eq!(form.flag("validation.required"), Some(true));
        assert_eq!(
            form.pairs("dependencies"),
            vec![
                ("ubo".to_string(), vec!["kyc".to_string()]),
                ("trading".to_string(), vec!["custody".to_string()]),
            ]
        );
        assert_eq!(
            form.missing(&["attributes", "conflict.resolution"]),
            vec!["conflict.resolution"]
        );
    }

    #[test]
    fn test_bare_atom_is_not_a_verb_form() {
        let err = VerbForm::parse_all("\"just text\"").unwrap_err();
        assert!(matches!(err, VerbError::NotAVerbForm { line: 1, .. }));
    }
}
