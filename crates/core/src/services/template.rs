//! Email template engine.
//!
//! Templates are compiled into the binary and registered once at
//! construction. Rendering is a pure function of the template and the job
//! data, so a single engine is shared by every worker through an `Arc`.

use std::collections::HashMap;
use std::sync::LazyLock;

use postbox_common::{AppError, config::EmailConfig};
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[allow(clippy::unwrap_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Template rendering errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// No template is registered under this key.
    #[error("unknown template type '{0}'")]
    NotFound(String),

    /// The data is missing a field the template requires.
    #[error("template '{template}' requires field '{field}'")]
    MissingField { template: String, field: String },

    /// The data is not a JSON object.
    #[error("template data for '{0}' must be a JSON object")]
    InvalidData(String),
}

impl From<TemplateError> for AppError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::NotFound(_) => Self::TemplateNotFound(err.to_string()),
            TemplateError::MissingField { .. } | TemplateError::InvalidData(_) => {
                Self::Render(err.to_string())
            }
        }
    }
}

/// Public description of a registered template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub required_fields: Vec<String>,
}

/// A rendered message, ready for a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

struct Template {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    required: &'static [&'static str],
    subject: &'static str,
    text: &'static str,
    html: &'static str,
}

const BUTTON_STYLE: &str = "display:inline-block;padding:12px 24px;background:#007bff;color:#fff;text-decoration:none;border-radius:4px;";

fn builtin_templates() -> Vec<Template> {
    vec![
        Template {
            id: "welcome",
            name: "Welcome",
            description: "Sent once after a new account is created.",
            required: &["recipient_name"],
            subject: "Welcome to {{instance_name}}!",
            text: "Hi {{recipient_name}}!\n\n\
                   Welcome to {{instance_name}}! We're glad to have you.\n\n\
                   Get started: {{instance_url}}\n\n\
                   If you have any questions, feel free to reach out.",
            html: "<p>Hi {{recipient_name}}!</p>\
                   <p>Welcome to <strong>{{instance_name}}</strong>! We're glad to have you.</p>\
                   <p><a href=\"{{instance_url}}\" style=\"{{button_style}}\">Get Started</a></p>\
                   <p>If you have any questions, feel free to reach out.</p>",
        },
        Template {
            id: "message_notification",
            name: "New message",
            description: "Tells a user that someone sent them a direct message.",
            required: &["sender_name", "message_preview"],
            subject: "New message from {{sender_name}} on {{instance_name}}",
            text: "Hi {{recipient_name}},\n\n\
                   You have a new message from {{sender_name}}:\n\n\
                   {{message_preview}}\n\n\
                   Log in to reply: {{instance_url}}/messages",
            html: "<p>Hi {{recipient_name}},</p>\
                   <p>You have a new message from <strong>{{sender_name}}</strong>:</p>\
                   <blockquote>{{message_preview}}</blockquote>\
                   <p><a href=\"{{instance_url}}/messages\">Log in to reply</a></p>",
        },
        Template {
            id: "review_confirmation",
            name: "Review confirmation",
            description: "Confirms that a submitted review was received.",
            required: &["item_name", "rating"],
            subject: "Thanks for reviewing {{item_name}}",
            text: "Hi {{recipient_name}},\n\n\
                   Thanks for your {{rating}}-star review of {{item_name}}. \
                   It will appear once it has been checked.\n\n\
                   {{instance_url}}",
            html: "<p>Hi {{recipient_name}},</p>\
                   <p>Thanks for your <strong>{{rating}}-star</strong> review of \
                   <strong>{{item_name}}</strong>. It will appear once it has been checked.</p>",
        },
        Template {
            id: "password_reset",
            name: "Password reset",
            description: "Carries a single-use link for resetting a password.",
            required: &["reset_url"],
            subject: "Reset your password on {{instance_name}}",
            text: "You requested a password reset for your account on {{instance_name}}.\n\n\
                   Click the following link to reset your password:\n{{reset_url}}\n\n\
                   If you didn't request this, you can safely ignore this email.",
            html: "<p>You requested a password reset for your account on {{instance_name}}.</p>\
                   <p><a href=\"{{reset_url}}\" style=\"{{button_style}}\">Reset Password</a></p>\
                   <p><small>If you didn't request this, you can safely ignore this email.</small></p>",
        },
        Template {
            id: "email_verification",
            name: "Email verification",
            description: "Asks the recipient to confirm their address.",
            required: &["verification_url", "code"],
            subject: "Verify your email on {{instance_name}}",
            text: "Please verify your email address for your account on {{instance_name}}.\n\n\
                   Click the following link to verify:\n{{verification_url}}\n\n\
                   Or enter this code: {{code}}",
            html: "<p>Please verify your email address for your account on {{instance_name}}.</p>\
                   <p><a href=\"{{verification_url}}\" style=\"{{button_style}}\">Verify Email</a></p>\
                   <p>Or enter this code: <strong>{{code}}</strong></p>",
        },
        Template {
            id: "security_alert",
            name: "Security alert",
            description: "Reports account activity the user should double-check.",
            required: &["event"],
            subject: "Security alert from {{instance_name}}",
            text: "We noticed the following activity on your {{instance_name}} account:\n\n\
                   {{event}}\n\n\
                   If this wasn't you, please change your password immediately: \
                   {{instance_url}}/settings/security",
            html: "<p style=\"color:#dc3545;\"><strong>Security Alert</strong></p>\
                   <p>We noticed the following activity on your {{instance_name}} account:</p>\
                   <blockquote>{{event}}</blockquote>\
                   <p>If this wasn't you, please \
                   <a href=\"{{instance_url}}/settings/security\">change your password</a> immediately.</p>",
        },
    ]
}

/// Renders job data into subject, text and HTML bodies.
pub struct TemplateEngine {
    templates: HashMap<&'static str, Template>,
    instance_name: String,
    instance_url: String,
}

impl TemplateEngine {
    /// Create an engine with the built-in templates.
    #[must_use]
    pub fn new(instance_name: impl Into<String>, instance_url: impl Into<String>) -> Self {
        let templates = builtin_templates()
            .into_iter()
            .map(|t| (t.id, t))
            .collect();

        Self {
            templates,
            instance_name: instance_name.into(),
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create an engine from the email configuration.
    #[must_use]
    pub fn from_config(config: &EmailConfig) -> Self {
        Self::new(config.instance_name.clone(), config.instance_url.clone())
    }

    /// Whether a template is registered under `template_type`.
    #[must_use]
    pub fn contains(&self, template_type: &str) -> bool {
        self.templates.contains_key(template_type)
    }

    /// Descriptors for every registered template, sorted by id.
    #[must_use]
    pub fn available_templates(&self) -> Vec<TemplateDescriptor> {
        let mut descriptors: Vec<_> = self
            .templates
            .values()
            .map(|t| TemplateDescriptor {
                id: t.id.to_string(),
                name: t.name.to_string(),
                description: t.description.to_string(),
                required_fields: t.required.iter().map(ToString::to_string).collect(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// Render `template_type` with `data`.
    ///
    /// `data` must be an object (or `null`, treated as empty). Required
    /// fields must be present as strings, numbers or booleans. Optional
    /// placeholders with no value render as empty text.
    pub fn render(&self, template_type: &str, data: &Value) -> Result<RenderedEmail, TemplateError> {
        let template = self
            .templates
            .get(template_type)
            .ok_or_else(|| TemplateError::NotFound(template_type.to_string()))?;

        let empty = Map::new();
        let fields = match data {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(TemplateError::InvalidData(template_type.to_string())),
        };

        for field in template.required {
            if scalar_text(fields.get(*field)).is_none() {
                return Err(TemplateError::MissingField {
                    template: template_type.to_string(),
                    field: (*field).to_string(),
                });
            }
        }

        let lookup = |key: &str| -> String {
            match key {
                "instance_name" => self.instance_name.clone(),
                "instance_url" => self.instance_url.clone(),
                "button_style" => BUTTON_STYLE.to_string(),
                _ => scalar_text(fields.get(key)).unwrap_or_default(),
            }
        };

        let subject = substitute(template.subject, &lookup, false);
        let text = substitute(template.text, &lookup, false);
        let content = substitute(template.html, &lookup, true);

        Ok(RenderedEmail {
            // Header injection guard
            subject: subject.replace(['\r', '\n'], " "),
            html: self.wrap_html(&content),
            text,
        })
    }

    /// Wrap HTML content in the shared layout.
    fn wrap_html(&self, content: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px; }}
        a {{ color: #007bff; }}
        blockquote {{ margin: 10px 0; padding: 10px 20px; border-left: 4px solid #e9ecef; background: #f8f9fa; }}
    </style>
</head>
<body>
    {content}
    <hr style="margin-top: 40px; border: none; border-top: 1px solid #e9ecef;">
    <p style="font-size: 12px; color: #6c757d;">
        This email was sent from <a href="{url}">{name}</a>.
    </p>
</body>
</html>"#,
            url = html_escape(&self.instance_url),
            name = html_escape(&self.instance_name),
        )
    }
}

/// Text for a scalar JSON value; `None` for missing, null, arrays and objects.
fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn substitute(template: &str, lookup: &dyn Fn(&str) -> String, escape: bool) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            let raw = lookup(key);
            // Layout constants are trusted markup
            if escape && key != "button_style" {
                html_escape(&raw)
            } else {
                raw
            }
        })
        .into_owned()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
