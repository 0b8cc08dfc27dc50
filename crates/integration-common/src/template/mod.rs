//! Templating for config entries and resource manifests

mod engine;
mod filters;

pub use engine::TemplateEngine;
