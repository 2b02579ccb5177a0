//! Jinja2-style template rendering.

mod jinja;

pub use jinja::TemplateRenderer;
