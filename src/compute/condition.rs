//! Boolean conditions over agent properties.
//!
//! The grammar lives in `condition.pest`. `&&` binds tighter than `||` and
//! `!` applies to a single primary. A bare key is true when the property
//! exists. Properties are multi-valued; a comparison holds if any value
//! satisfies it (`!=` holds if none equals). String comparison ignores
//! ASCII case.

use std::fmt;

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest condition accepted, in bytes.
pub const MAX_CONDITION_LEN: usize = 4096;

/// Deepest parenthesis nesting accepted.
pub const MAX_NESTING: usize = 32;

#[derive(Parser)]
#[grammar = "src/compute/condition.pest"]
struct ConditionGrammar;

/// Anything that exposes `key=value` style properties.
pub trait PropertySource {
    fn property_values(&self, key: &str) -> Vec<&str>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("Condition is {0} bytes long, limit is {limit}", limit = MAX_CONDITION_LEN)]
    TooLong(usize),

    #[error("Condition nests deeper than {limit} levels", limit = MAX_NESTING)]
    TooDeep,

    #[error("Syntax error at column {column}: {message}")]
    Syntax { column: usize, message: String },
}

impl From<pest::error::Error<Rule>> for ConditionError {
    fn from(e: pest::error::Error<Rule>) -> Self {
        let column = match e.line_col {
            pest::error::LineColLocation::Pos((_, col)) => col,
            pest::error::LineColLocation::Span((_, col), _) => col,
        };
        ConditionError::Syntax {
            column,
            message: e.variant.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(bool),
    Exists(String),
    Compare {
        key: String,
        op: CompareOp,
        value: String,
    },
    Not(Box<Expr>),
    All(Vec<Expr>),
    Any(Vec<Expr>),
}

/// Deepest parenthesis nesting outside string literals.
fn nesting_depth(text: &str) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut quote = None;
    for c in text.chars() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            (None, ')') => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

fn unexpected(pair: &Pair<Rule>) -> ConditionError {
    ConditionError::Syntax {
        column: pair.as_span().start_pos().line_col().1,
        message: format!("unexpected {:?}", pair.as_rule()),
    }
}

/// Strip matching single or double quotes.
fn unquote(s: &str) -> String {
    let quoted = s.len() >= 2
        && ((s.starts_with('\'') && s.ends_with('\''))
            || (s.starts_with('"') && s.ends_with('"')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Collapse a single-child list into the child itself.
fn flatten(mut exprs: Vec<Expr>, wrap: fn(Vec<Expr>) -> Expr) -> Expr {
    if exprs.len() == 1 {
        exprs.remove(0)
    } else {
        wrap(exprs)
    }
}

fn parse_expression(pair: Pair<Rule>) -> Result<Expr, ConditionError> {
    let terms = pair
        .into_inner()
        .map(parse_conjunction)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(flatten(terms, Expr::Any))
}

fn parse_conjunction(pair: Pair<Rule>) -> Result<Expr, ConditionError> {
    let terms = pair
        .into_inner()
        .map(parse_unary)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(flatten(terms, Expr::All))
}

fn parse_unary(pair: Pair<Rule>) -> Result<Expr, ConditionError> {
    let mut negations = 0usize;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::not_op => negations += 1,
            _ => {
                let expr = parse_primary(inner)?;
                return Ok(if negations % 2 == 1 {
                    Expr::Not(Box::new(expr))
                } else {
                    expr
                });
            }
        }
    }
    Err(ConditionError::Syntax {
        column: 0,
        message: "missing operand".to_string(),
    })
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expr, ConditionError> {
    match pair.as_rule() {
        Rule::paren_expr => {
            let inner = pair
                .clone()
                .into_inner()
                .next()
                .ok_or_else(|| unexpected(&pair))?;
            parse_expression(inner)
        }
        Rule::bool_literal => Ok(Expr::Literal(pair.as_str().eq_ignore_ascii_case("true"))),
        Rule::exists => {
            let key = operand(&mut pair.clone().into_inner(), &pair)?;
            Ok(Expr::Exists(key))
        }
        Rule::comparison => {
            let mut inner = pair.clone().into_inner();
            let key = operand(&mut inner, &pair)?;
            let op = match inner.next().map(|p| p.as_str()) {
                Some("==") => CompareOp::Eq,
                Some("!=") => CompareOp::Ne,
                Some("<") => CompareOp::Lt,
                Some("<=") => CompareOp::Le,
                Some(">") => CompareOp::Gt,
                Some(">=") => CompareOp::Ge,
                _ => return Err(unexpected(&pair)),
            };
            let value = operand(&mut inner, &pair)?;
            Ok(Expr::Compare { key, op, value })
        }
        _ => Err(unexpected(&pair)),
    }
}

fn operand(pairs: &mut Pairs<Rule>, parent: &Pair<Rule>) -> Result<String, ConditionError> {
    let pair = pairs.next().ok_or_else(|| unexpected(parent))?;
    match pair.as_rule() {
        Rule::word => Ok(pair.as_str().to_string()),
        Rule::string_literal => Ok(unquote(pair.as_str())),
        _ => Err(unexpected(&pair)),
    }
}

fn compare(actual: &str, op: CompareOp, expected: &str) -> bool {
    if let (Ok(a), Ok(b)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        return match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        };
    }
    let ordering = actual
        .to_ascii_lowercase()
        .cmp(&expected.to_ascii_lowercase());
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    }
}

impl Expr {
    fn evaluate(&self, source: &dyn PropertySource) -> bool {
        match self {
            Expr::Literal(b) => *b,
            Expr::Exists(key) => !source.property_values(key).is_empty(),
            Expr::Compare { key, op, value } => {
                let values = source.property_values(key);
                if *op == CompareOp::Ne {
                    values.iter().all(|v| compare(v, CompareOp::Ne, value))
                } else {
                    values.iter().any(|v| compare(v, *op, value))
                }
            }
            Expr::Not(inner) => !inner.evaluate(source),
            Expr::All(terms) => terms.iter().all(|t| t.evaluate(source)),
            Expr::Any(terms) => terms.iter().any(|t| t.evaluate(source)),
        }
    }
}

/// A parsed condition. Keeps its source text for display and serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    text: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        if text.len() > MAX_CONDITION_LEN {
            return Err(ConditionError::TooLong(text.len()));
        }
        if nesting_depth(text) > MAX_NESTING {
            return Err(ConditionError::TooDeep);
        }

        let root = ConditionGrammar::parse(Rule::condition, text)?
            .next()
            .and_then(|condition| {
                condition
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::expression)
            });
        let Some(root) = root else {
            return Ok(Self {
                text: String::new(),
                expr: Expr::Literal(true),
            });
        };
        Ok(Self {
            text: text.trim().to_string(),
            expr: parse_expression(root)?,
        })
    }

    pub fn evaluate(&self, source: &dyn PropertySource) -> bool {
        self.expr.evaluate(source)
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for Condition {
    type Error = ConditionError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Condition::parse(&text)
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Props(Vec<(&'static str, &'static str)>);

    impl PropertySource for Props {
        fn property_values(&self, key: &str) -> Vec<&str> {
            self.0
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| *v)
                .collect()
        }
    }

    fn props() -> Props {
        Props(vec![
            ("OSFamily", "Windows"),
            ("RAM", "64"),
            ("Tag", "gpu"),
            ("Tag", "fast"),
        ])
    }

    fn eval(text: &str) -> bool {
        Condition::parse(text).unwrap().evaluate(&props())
    }

    #[test]
    fn empty_condition_is_true() {
        assert!(eval(""));
        assert!(eval("   "));
    }

    #[test]
    fn equality_ignores_case() {
        assert!(eval("OSFamily == 'windows'"));
        assert!(eval("osfamily == Windows"));
        assert!(!eval("OSFamily == 'Linux'"));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval("RAM >= 32"));
        assert!(eval("RAM > 63.5"));
        assert!(!eval("RAM < 64"));
        assert!(eval("RAM <= 64"));
    }

    #[test]
    fn multi_valued_properties() {
        assert!(eval("Tag == gpu"));
        assert!(eval("Tag == 'fast'"));
        assert!(!eval("Tag != gpu"));
        assert!(eval("Tag != slow"));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        assert!(eval("OSFamily == Linux || RAM >= 32 && Tag == gpu"));
        assert!(!eval("(OSFamily == Linux || RAM >= 32) && Tag == cpu"));
        assert!(eval("!(OSFamily == Linux)"));
        assert!(eval("Tag && !Missing"));
        assert!(!eval("false || Missing"));
    }

    #[test]
    fn parse_errors() {
        for text in [
            "OSFamily == 'Windows",
            "(RAM > 1",
            "RAM > 1 )",
            "RAM ==",
            "&& RAM",
        ] {
            assert!(
                matches!(
                    Condition::parse(text).unwrap_err(),
                    ConditionError::Syntax { .. }
                ),
                "{}",
                text
            );
        }
        assert!(matches!(
            Condition::parse("RAM # 1").unwrap_err(),
            ConditionError::Syntax { column: 5, .. }
        ));
    }

    #[test]
    fn negation_runs_collapse() {
        assert!(eval("!!Tag"));
        assert!(!eval("!!!Tag"));
        assert!(eval("! ! ! Missing"));

        let long_run = format!("{}Tag", "!".repeat(1000));
        assert!(Condition::parse(&long_run).unwrap().evaluate(&props()));
    }

    #[test]
    fn oversized_conditions_are_rejected() {
        let huge = format!("{}a", "!".repeat(500_000));
        assert_eq!(
            Condition::parse(&huge).unwrap_err(),
            ConditionError::TooLong(500_001)
        );

        let chain = vec!["Tag"; 500].join(" && ");
        assert!(chain.len() <= MAX_CONDITION_LEN);
        assert!(Condition::parse(&chain).unwrap().evaluate(&props()));
    }

    #[test]
    fn nesting_is_bounded() {
        let nested = |depth: usize| format!("{}Tag{}", "(".repeat(depth), ")".repeat(depth));
        assert!(Condition::parse(&nested(MAX_NESTING))
            .unwrap()
            .evaluate(&props()));
        assert_eq!(
            Condition::parse(&nested(MAX_NESTING + 1)).unwrap_err(),
            ConditionError::TooDeep
        );
        assert_eq!(
            Condition::parse(&"(".repeat(100_000)).unwrap_err(),
            ConditionError::TooLong(100_000)
        );
        // Parentheses inside quotes do not count
        let quoted = format!("Tag != '{}'", "(".repeat(MAX_NESTING + 1));
        assert!(Condition::parse(&quoted).unwrap().evaluate(&props()));
    }

    #[test]
    fn serde_uses_source_text() {
        let condition = Condition::parse("RAM >= 32").unwrap();
        let json = serde_json::to_string(&condition).unwrap();
        assert_eq!(json, "\"RAM >= 32\"");
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, condition);
        assert!(serde_json::from_str::<Condition>("\"(\"").is_err());
    }
}
