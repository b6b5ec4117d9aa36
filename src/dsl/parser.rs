//! nom-based S-expression reader
//!
//! Reads orchestration and domain fragments into a small untyped tree. The
//! reader is deliberately grammar-agnostic: verbs, parameters and nesting
//! are interpreted by the callers, not here.

use dsl_types::SourceLocation;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_until, take_while1},
    character::complete::{char, multispace1, none_of},
    combinator::{cut, map, opt, value},
    error::{context, VerboseError, VerboseErrorKind},
    multi::many0,
    sequence::{delimited, pair, preceded},
    Finish, IResult,
};

use crate::error::ParseError;

pub type NomParseError<'a> = VerboseError<&'a str>;
type ParseResult<'a, T> = IResult<&'a str, T, NomParseError<'a>>;

/// Untyped S-expression node
#[derive(Debug, Clone, PartialEq)]
pub enum SExpr {
    Str(String),
    Number(f64),
    Bool(bool),
    Symbol(String),
    /// `@attr{identifier}`
    AttrRef(String),
    /// `( ... )` and `[ ... ]`
    List(Vec<SExpr>),
}

/// A top-level form together with where it started
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedForm {
    pub location: SourceLocation,
    pub expr: SExpr,
}

impl SExpr {
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            SExpr::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Text content of strings, symbols and attribute references
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SExpr::Str(s) | SExpr::Symbol(s) | SExpr::AttrRef(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[SExpr]> {
        match self {
            SExpr::List(items) => Some(items),
            _ => None,
        }
    }

    /// Leading symbol of a list form
    pub fn head(&self) -> Option<&str> {
        self.as_list()
            .and_then(|items| items.first())
            .and_then(SExpr::as_symbol)
    }

    /// Scalar rendering of an atom without quoting
    pub fn atom_text(&self) -> Option<String> {
        match self {
            SExpr::Str(s) | SExpr::Symbol(s) | SExpr::AttrRef(s) => Some(s.clone()),
            SExpr::Number(n) => Some(format_number(*n)),
            SExpr::Bool(b) => Some(b.to_string()),
            SExpr::List(_) => None,
        }
    }

    /// Every atom in this node, depth first
    pub fn flatten_text(&self) -> Vec<String> {
        match self {
            SExpr::List(items) => items.iter().flat_map(SExpr::flatten_text).collect(),
            atom => atom.atom_text().into_iter().collect(),
        }
    }

    /// Render back to DSL text
    pub fn render(&self) -> String {
        match self {
            SExpr::Str(s) => super::quote(s),
            SExpr::Number(n) => format_number(*n),
            SExpr::Bool(b) => b.to_string(),
            SExpr::Symbol(s) => s.clone(),
            SExpr::AttrRef(s) => format!("@attr{{{}}}", s),
            SExpr::List(items) => format!(
                "({})",
                items
                    .iter()
                    .map(SExpr::render)
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
        }
    }
}

impl std::fmt::Display for SExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Parse a whole document into its top-level forms
pub fn parse_document(input: &str) -> Result<Vec<LocatedForm>, ParseError> {
    let mut forms = Vec::new();
    let mut rest = input;

    loop {
        let (after_trivia, _) = skip_trivia(rest)
            .finish()
            .map_err(|e| syntax_error(input, e))?;
        if after_trivia.is_empty() {
            break;
        }

        let offset = input.len() - after_trivia.len();
        let (remaining, expr) = parse_expr(after_trivia)
            .finish()
            .map_err(|e| syntax_error(input, e))?;

        forms.push(LocatedForm {
            location: SourceLocation::from_offset(input, offset),
            expr,
        });
        rest = remaining;
    }

    Ok(forms)
}

/// Parse exactly one expression (surrounding trivia allowed)
pub fn parse_single(input: &str) -> Result<SExpr, ParseError> {
    let mut forms = parse_document(input)?;
    match forms.len() {
        1 => Ok(forms.remove(0).expr),
        0 => Err(ParseError::Syntax {
            location: SourceLocation::new(1, 1, 0),
            message: "expected an expression, found empty input".to_string(),
        }),
        _ => Err(ParseError::Syntax {
            location: forms[1].location.clone(),
            message: "expected a single expression".to_string(),
        }),
    }
}

fn syntax_error(input: &str, error: NomParseError<'_>) -> ParseError {
    match error.errors.first() {
        Some((rest, kind)) => {
            let offset = input.len().saturating_sub(rest.len());
            let message = match kind {
                VerboseErrorKind::Context(ctx) => format!("invalid {}", ctx),
                VerboseErrorKind::Char(c) => format!("expected '{}'", c),
                VerboseErrorKind::Nom(kind) => format!("unexpected input ({:?})", kind),
            };
            ParseError::Syntax {
                location: SourceLocation::from_offset(input, offset),
                message,
            }
        }
        None => ParseError::Syntax {
            location: SourceLocation::new(1, 1, 0),
            message: "unknown parse failure".to_string(),
        },
    }
}

/// Whitespace and `;` line comments
fn skip_trivia(input: &str) -> ParseResult<'_, ()> {
    let (input, _) = many0(alt((
        value((), multispace1),
        value((), pair(char(';'), take_till(|c| c == '\n'))),
    )))(input)?;
    Ok((input, ()))
}

fn parse_expr(input: &str) -> ParseResult<'_, SExpr> {
    preceded(
        skip_trivia,
        alt((
            context("list", parse_list),
            context("vector", parse_vector),
            map(parse_string, SExpr::Str),
            parse_attr_ref,
            parse_atom,
        )),
    )(input)
}

fn parse_list(input: &str) -> ParseResult<'_, SExpr> {
    map(
        delimited(
            char('('),
            many0(parse_expr),
            cut(preceded(skip_trivia, char(')'))),
        ),
        SExpr::List,
    )(input)
}

fn parse_vector(input: &str) -> ParseResult<'_, SExpr> {
    map(
        delimited(
            char('['),
            many0(preceded(pair(skip_trivia, opt(char(','))), parse_expr)),
            cut(preceded(skip_trivia, char(']'))),
        ),
        SExpr::List,
    )(input)
}

/// String literal with the usual escapes
pub fn parse_string(input: &str) -> ParseResult<'_, String> {
    delimited(
        char('"'),
        map(
            many0(alt((
                value('\n', tag("\\n")),
                value('\r', tag("\\r")),
                value('\t', tag("\\t")),
                value('\\', tag("\\\\")),
                value('"', tag("\\\"")),
                none_of("\"\\"),
            ))),
            |chars| chars.into_iter().collect(),
        ),
        char('"'),
    )(input)
}

fn parse_attr_ref(input: &str) -> ParseResult<'_, SExpr> {
    let (input, body) = delimited(tag("@attr{"), take_until("}"), char('}'))(input)?;
    let id = body.trim().trim_matches('"').to_string();
    Ok((input, SExpr::AttrRef(id)))
}

fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric() || "-_.:/?*+!<>=#%&$'".contains(c)
}

/// Symbols, numbers and booleans share one token shape
fn parse_atom(input: &str) -> ParseResult<'_, SExpr> {
    let (rest, token) = take_while1(is_symbol_char)(input)?;
    Ok((rest, classify_token(token)))
}

fn classify_token(token: &str) -> SExpr {
    match token {
        "true" => return SExpr::Bool(true),
        "false" => return SExpr::Bool(false),
        _ => {}
    }

    let mut chars = token.chars();
    let numeric_start = match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('-') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    };
    if numeric_start {
        if let Ok(n) = token.parse::<f64>() {
            return SExpr::Number(n);
        }
    }

    SExpr::Symbol(token.to_string())
}
