use std::cmp::Ordering;

use async_trait::async_trait;
use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::attribute::AttributeValue;

use super::{RuleContext, RuleError, RuleEvaluator};

#[derive(Parser)]
#[grammar = "rule/grammar.pest"]
struct RuleParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(AttributeValue),
    Path(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// Built-in evaluator for comparison expressions such as
/// `resource.public == true && subject.level >= 3`.
///
/// Supports `||`, `&&`, `!`, `== != < <= > >= in`, parentheses, boolean,
/// number, string and list literals, and dotted variable paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComparisonEvaluator;

impl ComparisonEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn evaluate_sync(
        &self,
        expression: &str,
        context: &RuleContext,
    ) -> Result<AttributeValue, RuleError> {
        let expr = parse(expression)?;
        eval(&expr, context)
    }
}

#[async_trait]
impl RuleEvaluator for ComparisonEvaluator {
    async fn evaluate(
        &self,
        expression: &str,
        context: &RuleContext,
    ) -> Result<AttributeValue, RuleError> {
        self.evaluate_sync(expression, context)
    }
}

fn parse(input: &str) -> Result<Expr, RuleError> {
    let mut pairs = RuleParser::parse(Rule::expression, input)
        .map_err(|e| RuleError::Syntax(e.to_string()))?;
    let expression = pairs.next().ok_or_else(|| missing_token("expression"))?;
    let or_expr = expression
        .into_inner()
        .next()
        .ok_or_else(|| missing_token("expression body"))?;
    build_or(or_expr)
}

fn missing_token(context: &str) -> RuleError {
    RuleError::Syntax(format!("missing token: {context}"))
}

fn unexpected_rule(rule: Rule) -> RuleError {
    RuleError::Syntax(format!("unexpected rule: {rule:?}"))
}

fn build_or(pair: Pair<'_, Rule>) -> Result<Expr, RuleError> {
    let mut children = pair
        .into_inner()
        .map(build_and)
        .collect::<Result<Vec<_>, _>>()?;
    if children.len() == 1 {
        return children.pop().ok_or_else(|| missing_token("or operand"));
    }
    Ok(Expr::Or(children))
}

fn build_and(pair: Pair<'_, Rule>) -> Result<Expr, RuleError> {
    let mut children = pair
        .into_inner()
        .map(build_unary)
        .collect::<Result<Vec<_>, _>>()?;
    if children.len() == 1 {
        return children.pop().ok_or_else(|| missing_token("and operand"));
    }
    Ok(Expr::And(children))
}

fn build_unary(pair: Pair<'_, Rule>) -> Result<Expr, RuleError> {
    let mut negations = 0;
    let mut inner = None;
    for item in pair.into_inner() {
        match item.as_rule() {
            Rule::not_op => negations += 1,
            Rule::comparison => inner = Some(build_comparison(item)?),
            other => return Err(unexpected_rule(other)),
        }
    }
    let mut expr = inner.ok_or_else(|| missing_token("comparison"))?;
    for _ in 0..negations {
        expr = Expr::Not(Box::new(expr));
    }
    Ok(expr)
}

fn build_comparison(pair: Pair<'_, Rule>) -> Result<Expr, RuleError> {
    let mut inner = pair.into_inner();
    let left = build_operand(inner.next().ok_or_else(|| missing_token("operand"))?)?;
    let Some(op) = inner.next() else {
        return Ok(left);
    };
    let op = match op.as_str() {
        "==" => CompareOp::Eq,
        "!=" => CompareOp::Ne,
        "<" => CompareOp::Lt,
        "<=" => CompareOp::Le,
        ">" => CompareOp::Gt,
        ">=" => CompareOp::Ge,
        "in" => CompareOp::In,
        other => return Err(RuleError::Syntax(format!("unknown operator '{other}'"))),
    };
    let right = build_operand(inner.next().ok_or_else(|| missing_token("right operand"))?)?;
    Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
}

fn build_operand(pair: Pair<'_, Rule>) -> Result<Expr, RuleError> {
    match pair.as_rule() {
        Rule::boolean => Ok(Expr::Literal(AttributeValue::Bool(pair.as_str() == "true"))),
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(|n| Expr::Literal(AttributeValue::Number(n)))
            .map_err(|e| RuleError::Syntax(format!("invalid number '{}': {e}", pair.as_str()))),
        Rule::string => {
            let text = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
            Ok(Expr::Literal(AttributeValue::from(text)))
        }
        Rule::list => pair
            .into_inner()
            .map(build_or)
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::List),
        Rule::path => Ok(Expr::Path(pair.as_str().to_string())),
        Rule::or_expr => build_or(pair),
        other => Err(unexpected_rule(other)),
    }
}

fn eval(expr: &Expr, ctx: &RuleContext) -> Result<AttributeValue, RuleError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => ctx
            .lookup(path)
            .cloned()
            .ok_or_else(|| RuleError::UnknownVariable(path.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(AttributeValue::List),
        Expr::Not(inner) => Ok(AttributeValue::Bool(!eval_bool(inner, ctx)?)),
        Expr::And(children) => {
            for child in children {
                if !eval_bool(child, ctx)? {
                    return Ok(AttributeValue::Bool(false));
                }
            }
            Ok(AttributeValue::Bool(true))
        }
        Expr::Or(children) => {
            for child in children {
                if eval_bool(child, ctx)? {
                    return Ok(AttributeValue::Bool(true));
                }
            }
            Ok(AttributeValue::Bool(false))
        }
        Expr::Compare(left, op, right) => {
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            compare(&left, *op, &right).map(AttributeValue::Bool)
        }
    }
}

fn eval_bool(expr: &Expr, ctx: &RuleContext) -> Result<bool, RuleError> {
    let value = eval(expr, ctx)?;
    value.as_bool().ok_or(RuleError::NotBoolean(value.kind()))
}

fn compare(left: &AttributeValue, op: CompareOp, right: &AttributeValue) -> Result<bool, RuleError> {
    let mismatch = || RuleError::TypeMismatch {
        op: op.symbol().to_string(),
        left: left.kind(),
        right: right.kind(),
    };

    let order = || match (left, right) {
        (AttributeValue::Number(a), AttributeValue::Number(b)) => {
            a.partial_cmp(b).ok_or_else(mismatch)
        }
        (AttributeValue::String(a), AttributeValue::String(b)) => Ok(a.cmp(b)),
        _ => Err(mismatch()),
    };

    match op {
        CompareOp::In => contains(right, left).ok_or_else(mismatch),
        _ if left.kind() != right.kind() => Err(mismatch()),
        CompareOp::Eq => Ok(left == right),
        CompareOp::Ne => Ok(left != right),
        CompareOp::Lt => order().map(|o| o == Ordering::Less),
        CompareOp::Le => order().map(|o| o != Ordering::Greater),
        CompareOp::Gt => order().map(|o| o == Ordering::Greater),
        CompareOp::Ge => order().map(|o| o != Ordering::Less),
    }
}

/// Membership for `in`: list elements, substrings, or map keys.
fn contains(container: &AttributeValue, item: &AttributeValue) -> Option<bool> {
    match container {
        AttributeValue::List(items) => Some(items.contains(item)),
        AttributeValue::String(haystack) => item.as_str().map(|needle| haystack.contains(needle)),
        AttributeValue::Map(fields) => item.as_str().map(|key| fields.contains_key(key)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::tuple::EntityRef;

    fn context() -> RuleContext {
        let resource = BTreeMap::from([
            ("public".to_string(), AttributeValue::Bool(false)),
            ("classification".to_string(), AttributeValue::Number(2.0)),
            ("department".to_string(), AttributeValue::from("eng")),
            (
                "tags".to_string(),
                AttributeValue::from(vec!["draft", "internal"]),
            ),
        ]);
        let subject = BTreeMap::from([
            ("clearance".to_string(), AttributeValue::Number(3.0)),
            ("department".to_string(), AttributeValue::from("eng")),
        ]);
        RuleContext::for_check(
            &EntityRef::new("document", "plan"),
            resource,
            &EntityRef::new("user", "alice"),
            subject,
        )
    }

    fn eval_str(expr: &str) -> Result<AttributeValue, RuleError> {
        ComparisonEvaluator::new().evaluate_sync(expr, &context())
    }

    fn assert_true(expr: &str) {
        assert_eq!(eval_str(expr), Ok(AttributeValue::Bool(true)), "{expr}");
    }

    fn assert_false(expr: &str) {
        assert_eq!(eval_str(expr), Ok(AttributeValue::Bool(false)), "{expr}");
    }

    #[test]
    fn equality_on_attributes() {
        assert_false("resource.public == true");
        assert_true("resource.public != true");
        assert_true("resource.department == subject.department");
        assert_true("resource.department == \"eng\"");
        assert_true("subject.type == 'user'");
    }

    #[test]
    fn ordering_on_numbers_and_strings() {
        assert_true("subject.clearance >= resource.classification");
        assert_false("subject.clearance < 3");
        assert_true("subject.clearance <= 3.0");
        assert_true("resource.id > 'alpha'");
    }

    #[test]
    fn membership_in_lists_strings_and_maps() {
        assert_true("'draft' in resource.tags");
        assert_false("'final' in resource.tags");
        assert_true("subject.department in ['eng', 'ops']");
        assert_true("'ng' in resource.department");
        assert_true("'public' in resource");
    }

    #[test]
    fn boolean_connectives_and_grouping() {
        assert_true("resource.public || subject.clearance > 1");
        assert_false("resource.public && subject.clearance > 1");
        assert_true("!resource.public");
        assert_true("!(resource.public || subject.clearance < 1)");
        assert_true("(resource.public == false) && (subject.department == 'eng')");
    }

    #[test]
    fn and_short_circuits_before_unknown_variables() {
        assert_false("resource.public && resource.missing == 1");
    }

    #[test]
    fn bare_path_yields_its_value() {
        assert_eq!(eval_str("resource.classification"), Ok(AttributeValue::Number(2.0)));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        assert_eq!(
            eval_str("resource.owner == 'alice'"),
            Err(RuleError::UnknownVariable("resource.owner".to_string()))
        );
    }

    #[test]
    fn mismatched_kinds_are_errors() {
        assert!(matches!(
            eval_str("resource.public == 'yes'"),
            Err(RuleError::TypeMismatch { ref op, .. }) if op == "=="
        ));
        assert!(matches!(
            eval_str("resource.tags < 3"),
            Err(RuleError::TypeMismatch { .. })
        ));
        assert!(matches!(
            eval_str("resource.department && true"),
            Err(RuleError::NotBoolean(_))
        ));
    }

    #[test]
    fn ordering_unorderable_kinds_is_an_error() {
        for op in ["<", "<=", ">", ">="] {
            let expr = format!("resource.public {op} false");
            assert!(
                matches!(eval_str(&expr), Err(RuleError::TypeMismatch { op: ref got, .. }) if got == op),
                "{expr}"
            );
        }
        assert!(matches!(
            eval_str("1 in resource.classification"),
            Err(RuleError::TypeMismatch { ref op, .. }) if op == "in"
        ));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(eval_str("resource.public =="), Err(RuleError::Syntax(_))));
        assert!(matches!(eval_str("(resource.public"), Err(RuleError::Syntax(_))));
        assert!(matches!(eval_str(""), Err(RuleError::Syntax(_))));
    }

    #[test]
    fn identifiers_starting_with_keywords_are_paths() {
        let mut ctx = RuleContext::new();
        ctx.insert("index", AttributeValue::Number(1.0));
        ctx.insert("truthy", AttributeValue::Bool(true));

        let evaluator = ComparisonEvaluator::new();
        assert_eq!(
            evaluator.evaluate_sync("index == 1 && truthy", &ctx),
            Ok(AttributeValue::Bool(true))
        );
    }
}
