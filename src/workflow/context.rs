//! Per-run parameter registry and scope stack.
//!
//! Parameter values are write-once per label; only a block's own retry may
//! rewrite its output parameter. Loop iterations push scope frames that
//! shadow outer names; resolution searches top-down. Secret values resolve
//! through the provider and register with the redactor so they never reach
//! logs or artifact payloads.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::error::{ExecutionError, Result};
use crate::workflow::template;

/// Replaces registered secret values in any outbound text.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    values: Vec<String>,
}

impl SecretRedactor {
    pub fn register(&mut self, value: &str) {
        if !value.is_empty() && !self.values.iter().any(|v| v == value) {
            self.values.push(value.to_string());
        }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            out = out.replace(value, "***");
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct RunContext {
    base: HashMap<String, Value>,
    written: HashSet<String>,
    scopes: Vec<HashMap<String, Value>>,
    secrets: HashMap<String, String>,
    redactor: SecretRedactor,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write-once set. A second write to the same label is a bug in the
    /// caller and is rejected.
    pub fn set(&mut self, name: &str, value: Value) -> Result<()> {
        if self.written.contains(name) {
            return Err(ExecutionError::Validation(format!(
                "parameter {} is already bound",
                name
            )));
        }
        self.written.insert(name.to_string());
        self.base.insert(name.to_string(), value);
        Ok(())
    }

    /// Output parameters may be rewritten by their owning block on retry.
    pub fn set_output(&mut self, name: &str, value: Value) {
        self.written.insert(name.to_string());
        self.base.insert(name.to_string(), value);
    }

    /// Top-down resolution through loop scopes, then the base frame.
    pub fn get(&self, name: &str) -> Option<&Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value);
            }
        }
        self.base.get(name)
    }

    pub fn push_scope(&mut self, frame: HashMap<String, Value>) {
        self.scopes.push(frame);
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn register_secret(&mut self, name: &str, value: &str) {
        self.redactor.register(value);
        self.secrets.insert(name.to_string(), value.to_string());
    }

    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    pub fn redactor(&self) -> &SecretRedactor {
        &self.redactor
    }

    /// All visible variables flattened for rendering; inner scopes shadow
    /// outer names, secrets are included as template variables.
    fn flattened(&self) -> HashMap<String, Value> {
        let mut vars = self.base.clone();
        for (name, value) in &self.secrets {
            vars.insert(name.clone(), Value::String(value.clone()));
        }
        for scope in &self.scopes {
            for (name, value) in scope {
                vars.insert(name.clone(), value.clone());
            }
        }
        vars
    }

    pub fn render(&self, template_str: &str, strict: bool) -> Result<String> {
        template::render(template_str, &self.flattened(), strict)
    }

    /// Variables exposed to `code` blocks: everything except secrets.
    pub fn code_vars(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        for (name, value) in &self.base {
            vars.insert(name.clone(), value.clone());
        }
        for scope in &self.scopes {
            for (name, value) in scope {
                vars.insert(name.clone(), value.clone());
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_once_is_enforced() {
        let mut ctx = RunContext::new();
        ctx.set("base", json!("https://ex.test")).unwrap();
        let err = ctx.set("base", json!("https://other.test")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        // Output rewrite is allowed (block retry).
        ctx.set_output("fetch_output", json!(1));
        ctx.set_output("fetch_output", json!(2));
        assert_eq!(ctx.get("fetch_output"), Some(&json!(2)));
    }

    #[test]
    fn scopes_shadow_and_pop() {
        let mut ctx = RunContext::new();
        ctx.set("name", json!("outer")).unwrap();
        let mut frame = HashMap::new();
        frame.insert("name".to_string(), json!("inner"));
        frame.insert("current_index".to_string(), json!(0));
        ctx.push_scope(frame);
        assert_eq!(ctx.get("name"), Some(&json!("inner")));
        assert_eq!(ctx.render("{{name}}-{{current_index}}", false).unwrap(), "inner-0");
        ctx.pop_scope();
        assert_eq!(ctx.get("name"), Some(&json!("outer")));
        assert_eq!(ctx.get("current_index"), None);
    }

    #[test]
    fn secrets_render_but_redact() {
        let mut ctx = RunContext::new();
        ctx.register_secret("api_token", "s3cr3t-value");
        assert_eq!(ctx.render("Bearer {{api_token}}", false).unwrap(), "Bearer s3cr3t-value");
        assert_eq!(
            ctx.redactor().redact("sending Bearer s3cr3t-value now"),
            "sending Bearer *** now"
        );
        assert!(ctx.code_vars().get("api_token").is_none(), "code blocks never see secrets");
    }
}
