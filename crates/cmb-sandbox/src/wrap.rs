//! Script-shape classification and wrapping.
//!
//! A submitted script may be an async callable expression, a synchronous
//! callable, or raw statements. The backend normalizes all of them into a
//! single invocable expression whose evaluation yields the script's return
//! value (directly or as a promise).

use oxc::ast::ast::{Expression, Statement};
use oxc::parser::Parser;
use oxc::span::SourceType;

/// Syntactic shape of a submitted script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptShape {
    AsyncFunction,
    SyncArrow,
    SyncFunction,
    RawStatements,
}

/// Classify a script by parsing it as a module and inspecting the top level.
///
/// A single expression statement holding a function or arrow literal is a
/// callable; everything else (including unparseable input) is raw
/// statements, which the wrapper turns into an async IIFE body.
pub fn classify_script(source: &str) -> ScriptShape {
    let allocator = oxc_allocator::Allocator::default();
    let parsed = Parser::new(&allocator, source, SourceType::mjs()).parse();
    if parsed.panicked || !parsed.errors.is_empty() {
        return ScriptShape::RawStatements;
    }

    let body = &parsed.program.body;
    if body.len() != 1 {
        return ScriptShape::RawStatements;
    }

    match &body[0] {
        Statement::ExpressionStatement(stmt) => shape_of_expression(&stmt.expression),
        Statement::FunctionDeclaration(func) => {
            if func.r#async {
                ScriptShape::AsyncFunction
            } else {
                ScriptShape::SyncFunction
            }
        }
        _ => ScriptShape::RawStatements,
    }
}

fn shape_of_expression(expr: &Expression) -> ScriptShape {
    match expr {
        Expression::ArrowFunctionExpression(arrow) => {
            if arrow.r#async {
                ScriptShape::AsyncFunction
            } else {
                ScriptShape::SyncArrow
            }
        }
        Expression::FunctionExpression(func) => {
            if func.r#async {
                ScriptShape::AsyncFunction
            } else {
                ScriptShape::SyncFunction
            }
        }
        Expression::ParenthesizedExpression(inner) => shape_of_expression(&inner.expression),
        _ => ScriptShape::RawStatements,
    }
}

/// Wrap a script into an invocable expression.
///
/// Callable scripts are invoked; synchronous callables are additionally
/// wrapped in an async IIFE when `always_async` is set so their result is
/// always a promise; raw statements always get the async IIFE so `await`
/// and `return` work at the top level.
pub fn wrap_script(source: &str, always_async: bool) -> String {
    let trimmed = source.trim();
    match classify_script(trimmed) {
        ScriptShape::AsyncFunction => format!("({trimmed})()"),
        ScriptShape::SyncArrow | ScriptShape::SyncFunction => {
            if always_async {
                format!("(async () => (({trimmed})()))()")
            } else {
                format!("({trimmed})()")
            }
        }
        ScriptShape::RawStatements => format!("(async () => {{\n{trimmed}\n}})()"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_async_arrow() {
        assert_eq!(
            classify_script("async () => await host.test__add({a: 1, b: 2})"),
            ScriptShape::AsyncFunction
        );
    }

    #[test]
    fn classifies_async_function_expression() {
        assert_eq!(
            classify_script("async function run() { return 1; }"),
            ScriptShape::AsyncFunction
        );
    }

    #[test]
    fn classifies_sync_arrow() {
        assert_eq!(classify_script("() => 42"), ScriptShape::SyncArrow);
    }

    #[test]
    fn classifies_sync_function() {
        assert_eq!(classify_script("function f() { return 42; }"), ScriptShape::SyncFunction);
    }

    #[test]
    fn parenthesized_callable_unwraps() {
        assert_eq!(classify_script("(async () => 1)"), ScriptShape::AsyncFunction);
    }

    #[test]
    fn statements_classify_as_raw() {
        assert_eq!(
            classify_script("const x = 1;\nreturn {type: 'json', value: x};"),
            ScriptShape::RawStatements
        );
    }

    #[test]
    fn unparseable_classifies_as_raw() {
        assert_eq!(classify_script("const = = ;"), ScriptShape::RawStatements);
    }

    #[test]
    fn async_callable_is_invoked() {
        assert_eq!(wrap_script("async () => 1", false), "(async () => 1)()");
    }

    #[test]
    fn sync_callable_invoked_directly_by_default() {
        assert_eq!(wrap_script("() => 1", false), "(() => 1)()");
    }

    #[test]
    fn sync_callable_wrapped_when_always_async() {
        assert_eq!(wrap_script("() => 1", true), "(async () => ((() => 1)()))()");
    }

    #[test]
    fn raw_statements_get_async_iife() {
        let wrapped = wrap_script("return 7;", false);
        assert!(wrapped.starts_with("(async () => {"));
        assert!(wrapped.contains("return 7;"));
        assert!(wrapped.ends_with("})()"));
    }

    #[test]
    fn leading_whitespace_is_ignored() {
        assert_eq!(wrap_script("\n\n  async () => 2", false), "(async () => 2)()");
    }
}
