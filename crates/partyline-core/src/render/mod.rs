//! Template rendering
//!
//! Every notification is rendered from a built-in minijinja template: a
//! one-line subject and an HTML body extending a shared layout. Undefined
//! variables are errors, so a missing field surfaces as [`TemplateError::InvalidData`]
//! instead of an email with a hole in it.

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use partyline_common::Result;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Template id used by ad-hoc queue sends
pub const GENERIC_TEMPLATE: &str = "generic";

/// A built-in template: subject and body registered under their own names
struct BuiltIn {
    id: &'static str,
    subject_name: &'static str,
    body_name: &'static str,
    subject: &'static str,
    body: &'static str,
}

const TEMPLATES: &[BuiltIn] = &[
    BuiltIn {
        id: "celebrant_notification",
        subject_name: "celebrant_notification.subject",
        body_name: "celebrant_notification.html",
        subject: r#"Happy birthday, {{ celebrant_name|default("friend") }}!"#,
        body: include_str!("../../templates/celebrant_notification.html"),
    },
    BuiltIn {
        id: "contributor_notification",
        subject_name: "contributor_notification.subject",
        body_name: "contributor_notification.html",
        subject: r#"It's time: {{ celebrant_name|default("the celebrant") }}'s birthday surprise is live"#,
        body: include_str!("../../templates/contributor_notification.html"),
    },
    BuiltIn {
        id: "reminder_week",
        subject_name: "reminder_week.subject",
        body_name: "reminder_week.html",
        subject: r#"One week left to add your message for {{ celebrant_name|default("the celebrant") }}"#,
        body: include_str!("../../templates/reminder_week.html"),
    },
    BuiltIn {
        id: "reminder_day",
        subject_name: "reminder_day.subject",
        body_name: "reminder_day.html",
        subject: r#"Last call: {{ celebrant_name|default("the celebrant") }}'s birthday is tomorrow"#,
        body: include_str!("../../templates/reminder_day.html"),
    },
    BuiltIn {
        id: "reminder_hour",
        subject_name: "reminder_hour.subject",
        body_name: "reminder_hour.html",
        subject: r#"One hour to go for {{ celebrant_name|default("the celebrant") }}"#,
        body: include_str!("../../templates/reminder_hour.html"),
    },
    BuiltIn {
        id: "thank_you",
        subject_name: "thank_you.subject",
        body_name: "thank_you.html",
        subject: r#"Thank you from {{ celebrant_name|default("all of us") }}"#,
        body: include_str!("../../templates/thank_you.html"),
    },
    BuiltIn {
        id: "admin_alert",
        subject_name: "admin_alert.subject",
        body_name: "admin_alert.html",
        subject: "Partyline fan-out fired at {{ fired_at }}",
        body: include_str!("../../templates/admin_alert.html"),
    },
    BuiltIn {
        id: "generic",
        subject_name: "generic.subject",
        body_name: "generic.html",
        subject: r#"{{ subject|default("A note from Partyline") }}"#,
        body: include_str!("../../templates/generic.html"),
    },
];

const LAYOUT: &str = include_str!("../../templates/layout.html");

/// Rendered subject and body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Rendering failures; both are permanent for the message at hand
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Invalid template data: {0}")]
    InvalidData(String),
}

/// Renders a template id against a data record
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template_id: &str, data: &Value) -> std::result::Result<RenderedEmail, TemplateError>;

    fn has_template(&self, template_id: &str) -> bool;
}

/// Renderer backed by the built-in templates
pub struct MiniJinjaRenderer {
    env: Environment<'static>,
}

impl MiniJinjaRenderer {
    /// Build the environment with every built-in template
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("url", url_attribute);

        env.add_template("layout.html", LAYOUT)
            .map_err(|e| partyline_common::Error::Template(format!("layout: {}", e)))?;

        for template in TEMPLATES {
            env.add_template(template.subject_name, template.subject)
                .map_err(|e| partyline_common::Error::Template(format!("{} subject: {}", template.id, e)))?;
            env.add_template(template.body_name, template.body)
                .map_err(|e| partyline_common::Error::Template(format!("{} body: {}", template.id, e)))?;
        }

        Ok(Self { env })
    }

    /// Ids of every registered template
    pub fn template_ids(&self) -> impl Iterator<Item = &'static str> {
        TEMPLATES.iter().map(|t| t.id)
    }

    fn render_one(&self, name: &str, data: &Value) -> std::result::Result<String, TemplateError> {
        let template = self
            .env
            .get_template(name)
            .map_err(|_| TemplateError::NotFound(name.to_string()))?;

        template.render(data).map_err(|e| match e.kind() {
            ErrorKind::TemplateNotFound => TemplateError::NotFound(name.to_string()),
            _ => TemplateError::InvalidData(format!("{}: {}", name, e)),
        })
    }
}

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(&self, template_id: &str, data: &Value) -> std::result::Result<RenderedEmail, TemplateError> {
        let template = TEMPLATES
            .iter()
            .find(|t| t.id == template_id)
            .ok_or_else(|| TemplateError::NotFound(template_id.to_string()))?;
        if !data.is_object() {
            return Err(TemplateError::InvalidData(
                "template data must be an object".to_string(),
            ));
        }

        let subject = self.render_one(template.subject_name, data)?;
        let html = self.render_one(template.body_name, data)?;

        Ok(RenderedEmail {
            subject: subject.trim().to_string(),
            html,
        })
    }

    fn has_template(&self, template_id: &str) -> bool {
        TEMPLATES.iter().any(|t| t.id == template_id)
    }
}

/// Escape a link for an HTML attribute, keeping `/` readable
fn url_attribute(value: String) -> minijinja::Value {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    minijinja::Value::from_safe_string(escaped)
}
