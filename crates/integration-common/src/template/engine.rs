//! Template engine for config entries and resource manifests
//!
//! Uses minijinja with the default Jinja delimiters and strict undefined
//! handling, so a typo in `{{ plugConfig.hots }}` fails the pass instead of
//! rendering an empty string.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;

use super::filters;
use crate::Error;

/// Template engine shared by the resolver and the resource applier
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new template engine
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        env.add_filter("default", filters::default_filter);
        env.add_filter("base64_encode", filters::base64_encode);
        env.add_filter("base64_decode", filters::base64_decode);
        env.add_filter("required", filters::required);

        Self { env }
    }

    /// Render a template string against a JSON context
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String, Error> {
        if !Self::has_template_syntax(template) {
            return Ok(template.to_string());
        }
        self.env
            .render_str(template, minijinja::Value::from_serialize(ctx))
            .map_err(Error::from)
    }

    /// Render every string leaf of a structured template
    ///
    /// Object keys are rendered too so that names like
    /// `"{{ plug.metadata.name }}-config"` work in maps.
    pub fn render_value(&self, template: &Value, ctx: &Value) -> Result<Value, Error> {
        Ok(match template {
            Value::String(s) => Value::String(self.render(s, ctx)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    rendered.insert(self.render(key, ctx)?, self.render_value(value, ctx)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }

    /// Check if a string contains any template syntax
    pub fn has_template_syntax(s: &str) -> bool {
        s.contains("{{") || s.contains("{%") || s.contains("{#")
    }
}
