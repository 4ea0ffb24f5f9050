//! Restricted template rendering for workflow parameter bindings.
//!
//! Variable substitution `{{name}}` with a closed filter set: identity,
//! upper, lower, trim, tojson, length, default. The renderer grants no
//! filesystem, network or code execution; undefined variables render empty
//! unless the block is strict, in which case rendering fails.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tera::Tera;

use crate::error::{ExecutionError, Result};

static EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[^}]*\}\}").expect("expression regex"));
static ROOT_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier regex"));

fn tojson_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let encoded = serde_json::to_string(value)
        .map_err(|e| tera::Error::msg(format!("tojson: {}", e)))?;
    Ok(tera::Value::String(encoded))
}

fn identity_filter(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    Ok(value.clone())
}

/// Render one template against a variable map.
pub fn render(template: &str, vars: &HashMap<String, Value>, strict: bool) -> Result<String> {
    // Resolve undefined roots up front: strict mode fails, lax mode blanks
    // the whole expression.
    let mut missing: Option<String> = None;
    let prepared = EXPRESSION.replace_all(template, |caps: &regex::Captures| {
        let expr = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let inner = expr.trim_start_matches("{{").trim_end_matches("}}");
        let root = ROOT_IDENT.find(inner).map(|m| m.as_str()).unwrap_or_default();
        if root.is_empty() || vars.contains_key(root) {
            expr.to_string()
        } else if inner.contains("default") {
            // The default filter handles its own missing value.
            expr.to_string()
        } else {
            missing = Some(root.to_string());
            String::new()
        }
    });
    if strict {
        if let Some(name) = missing {
            return Err(ExecutionError::ParameterUnbound(name));
        }
    }

    let mut tera = Tera::default();
    tera.register_filter("tojson", tojson_filter);
    tera.register_filter("identity", identity_filter);
    tera.add_raw_template("inline", &prepared)
        .map_err(|e| ExecutionError::Validation(format!("template parse: {}", e)))?;

    let mut context = tera::Context::new();
    for (key, value) in vars {
        context.insert(key.as_str(), value);
    }
    tera.render("inline", &context)
        .map_err(|e| ExecutionError::Validation(format!("template render: {}", render_error(e))))
}

fn render_error(e: tera::Error) -> String {
    let mut message = e.to_string();
    let mut source: Option<&dyn std::error::Error> = std::error::Error::source(&e);
    while let Some(inner) = source {
        message = format!("{}: {}", message, inner);
        source = inner.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn substitutes_variables() {
        let vars = vars(&[("base", json!("https://ex.test")), ("item", json!("a"))]);
        let out = render("{{base}}/item/{{item}}", &vars, false).unwrap();
        assert_eq!(out, "https://ex.test/item/a");
    }

    #[test]
    fn closed_filter_set_works() {
        let vars = vars(&[
            ("name", json!("  Alice  ")),
            ("items", json!(["a", "b", "c"])),
        ]);
        assert_eq!(render("{{name | trim | upper}}", &vars, false).unwrap(), "ALICE");
        assert_eq!(render("{{name | trim | lower}}", &vars, false).unwrap(), "alice");
        assert_eq!(render("{{items | length}}", &vars, false).unwrap(), "3");
        assert_eq!(
            render("{{items | tojson}}", &vars, false).unwrap(),
            "[\"a\",\"b\",\"c\"]"
        );
        assert_eq!(render("{{name | identity | trim}}", &vars, false).unwrap(), "Alice");
        assert_eq!(
            render("{{nope | default(value='fallback')}}", &vars, false).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn undefined_renders_empty_unless_strict() {
        let vars = vars(&[("known", json!("x"))]);
        assert_eq!(render("a={{unknown}} b={{known}}", &vars, false).unwrap(), "a= b=x");
        let err = render("a={{unknown}}", &vars, true).unwrap_err();
        assert_eq!(err.code(), "PARAMETER_UNBOUND");
    }

    #[test]
    fn plain_text_passes_through() {
        let out = render("no templates here", &HashMap::new(), true).unwrap();
        assert_eq!(out, "no templates here");
    }
}
