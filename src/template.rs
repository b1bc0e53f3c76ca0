//! Outbound content rendering seam.
//!
//! Real deployments render through stored, per-tenant templates; the
//! pipeline only depends on the trait. The default implementation wraps
//! message content in a minimal HTML shell.

use crate::error::TemplateError;
use crate::inbox::ChannelKind;

/// Renders outgoing message content for a channel.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, channel: ChannelKind, content: &str) -> Result<String, TemplateError>;
}

/// Placeholder substituted with the message content.
const CONTENT_PLACEHOLDER: &str = "{{content}}";

/// Default renderer with a single email template.
pub struct DefaultTemplates {
    email_template: String,
}

impl DefaultTemplates {
    pub fn new() -> Self {
        Self {
            email_template: format!(
                "<!doctype html><html><body><div>{CONTENT_PLACEHOLDER}</div></body></html>"
            ),
        }
    }

    /// Use a custom email template. Must contain the `{{content}}`
    /// placeholder.
    pub fn with_email_template(template: impl Into<String>) -> Result<Self, TemplateError> {
        let template = template.into();
        if !template.contains(CONTENT_PLACEHOLDER) {
            return Err(TemplateError::Render(format!(
                "template is missing the {CONTENT_PLACEHOLDER} placeholder"
            )));
        }
        Ok(Self {
            email_template: template,
        })
    }
}

impl Default for DefaultTemplates {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for DefaultTemplates {
    fn render(&self, channel: ChannelKind, content: &str) -> Result<String, TemplateError> {
        match channel {
            ChannelKind::Email => Ok(self.email_template.replace(CONTENT_PLACEHOLDER, content)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_wraps_content() {
        let templates = DefaultTemplates::new();
        let out = templates.render(ChannelKind::Email, "Hello").unwrap();
        assert!(out.contains("Hello"));
        assert!(out.starts_with("<!doctype html>"));
    }

    #[test]
    fn custom_template_requires_placeholder() {
        assert!(DefaultTemplates::with_email_template("no placeholder").is_err());
        let templates =
            DefaultTemplates::with_email_template("<p>{{content}}</p>").unwrap();
        assert_eq!(
            templates.render(ChannelKind::Email, "x").unwrap(),
            "<p>x</p>"
        );
    }
}
