//! Expression classification.
//!
//! Every dynamic string in a suite resolves through exactly one category,
//! decided by prefix in priority order:
//!
//! 1. `#faker.` -> faker generation (`category.method(args?)`)
//! 2. `@`       -> JMESPath query
//! 3. `$`       -> JavaScript expression (code block when it starts with
//!    `return` or contains `;`)
//! 4. contains `{{` -> template
//! 5. otherwise -> literal

use regex::Regex;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Expression category, decided by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionCategory {
    /// `#faker.category.method(args?)`
    Faker,
    /// `@query`
    Jmespath,
    /// `$expr` / `$js: expr`
    Javascript,
    /// String containing `{{...}}` placeholders
    Template,
    /// Plain value
    Literal,
}

/// Result of classifying a raw expression string.
#[derive(Debug, Clone)]
pub struct ParsedExpression {
    /// The decided category.
    pub category: ExpressionCategory,
    /// Payload with the category prefix stripped (whole string for
    /// templates and literals).
    pub payload: String,
    /// For JavaScript: whether the payload is a statement block rather
    /// than a single expression.
    pub code_block: bool,
    /// Lint warnings (ambiguous literals).
    pub warnings: Vec<String>,
}

fn jmespath_lookalike() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+|\[\d+\])+$")
            .expect("static regex")
    })
}

/// Classify a raw expression string.
///
/// # Errors
///
/// Returns `MixedSyntax` when categories are mixed outside `{{...}}`
/// braces (a faker expression containing a template placeholder).
pub fn parse(raw: &str) -> Result<ParsedExpression> {
    let trimmed = raw.trim();

    if let Some(rest) = trimmed.strip_prefix("#faker.") {
        if rest.contains("{{") {
            return Err(Error::MixedSyntax(format!(
                "faker expression contains a template placeholder: {raw}"
            )));
        }
        return Ok(ParsedExpression {
            category: ExpressionCategory::Faker,
            payload: rest.to_string(),
            code_block: false,
            warnings: Vec::new(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix('@') {
        // Placeholders inside a query are legal: the step executor
        // interpolates first, then compiles the query.
        return Ok(ParsedExpression {
            category: ExpressionCategory::Jmespath,
            payload: rest.trim().to_string(),
            code_block: false,
            warnings: Vec::new(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix('$') {
        let payload = rest.strip_prefix("js:").unwrap_or(rest).trim().to_string();
        let code_block = payload.starts_with("return") || payload.contains(';');
        return Ok(ParsedExpression {
            category: ExpressionCategory::Javascript,
            payload,
            code_block,
            warnings: Vec::new(),
        });
    }

    if trimmed.contains("{{") {
        return Ok(ParsedExpression {
            category: ExpressionCategory::Template,
            payload: raw.to_string(),
            code_block: false,
            warnings: Vec::new(),
        });
    }

    Ok(ParsedExpression {
        category: ExpressionCategory::Literal,
        payload: raw.to_string(),
        code_block: false,
        warnings: lint_literal(trimmed),
    })
}

/// Flag literals that textually resemble another category. They stay
/// literals; the warnings surface as bus events.
fn lint_literal(literal: &str) -> Vec<String> {
    let mut warnings = Vec::new();

    if jmespath_lookalike().is_match(literal) {
        warnings.push(format!(
            "'{literal}' looks like a JMESPath query; prefix it with '@' to evaluate it"
        ));
    }

    let js_markers = ["=>", "function(", "function ("];
    let js_prefixes = ["Math.", "JSON.", "Date.", "Number."];
    if js_markers.iter().any(|m| literal.contains(m))
        || js_prefixes.iter().any(|p| literal.starts_with(p))
    {
        warnings.push(format!(
            "'{literal}' looks like JavaScript; prefix it with '$' to evaluate it"
        ));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faker_prefix_wins_regardless_of_contents() {
        let parsed = parse("#faker.name.firstName").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Faker);
        assert_eq!(parsed.payload, "name.firstName");

        // Even with other markers inside, the category stays faker.
        let parsed = parse("#faker.internet.password(8)").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Faker);
    }

    #[test]
    fn faker_with_placeholder_is_mixed_syntax() {
        assert!(matches!(
            parse("#faker.name.{{which}}"),
            Err(Error::MixedSyntax(_))
        ));
    }

    #[test]
    fn at_prefix_is_jmespath() {
        let parsed = parse("@body.items[0].id").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Jmespath);
        assert_eq!(parsed.payload, "body.items[0].id");
    }

    #[test]
    fn jmespath_may_embed_placeholders() {
        let parsed = parse("@body.items[{{index}}].id").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Jmespath);
    }

    #[test]
    fn dollar_prefix_is_javascript() {
        let parsed = parse("$1 + 2").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Javascript);
        assert_eq!(parsed.payload, "1 + 2");
        assert!(!parsed.code_block);
    }

    #[test]
    fn js_marker_prefix_is_stripped() {
        let parsed = parse("$js: variables.count * 2").unwrap();
        assert_eq!(parsed.payload, "variables.count * 2");
    }

    #[test]
    fn statements_are_code_blocks() {
        assert!(parse("$return 42").unwrap().code_block);
        assert!(parse("$let x = 1; x + 1").unwrap().code_block);
        assert!(!parse("$x + 1").unwrap().code_block);
    }

    #[test]
    fn braces_make_a_template() {
        let parsed = parse("Bearer {{token}}").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Template);
        assert_eq!(parsed.payload, "Bearer {{token}}");
    }

    #[test]
    fn plain_strings_are_literals() {
        let parsed = parse("hello world").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Literal);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn jmespath_lookalike_literal_warns() {
        let parsed = parse("body.items[0].id").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Literal);
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("JMESPath"));
    }

    #[test]
    fn js_lookalike_literal_warns() {
        let parsed = parse("Math.floor(3.7)").unwrap();
        assert_eq!(parsed.category, ExpressionCategory::Literal);
        assert!(parsed.warnings.iter().any(|w| w.contains("JavaScript")));
    }
}
