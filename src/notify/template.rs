//! Notification templates.
//!
//! Templates carry a subject and body with `{{placeholder}}` slots filled at
//! publish time from the draft's metadata. An inactive template refuses
//! publication rather than silently falling back to raw content.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::message::Channel;

/// A reusable notification template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: String,
    pub name: String,
    /// Rendered into the message title
    pub subject: String,
    /// Rendered into the message body
    pub body: String,
    /// Channels this template is written for
    pub channels: Vec<Channel>,
    pub active: bool,
}

impl NotificationTemplate {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subject: subject.into(),
            body: body.into(),
            channels: vec![Channel::InApp],
            active: true,
        }
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Render subject and body, substituting `{{key}}` placeholders from
    /// `vars`. Placeholders with no matching variable are left intact so the
    /// omission is visible downstream.
    pub fn render(&self, vars: &HashMap<String, String>) -> (String, String) {
        (substitute(&self.subject, vars), substitute(&self.body, vars))
    }
}

fn substitute(text: &str, vars: &HashMap<String, String>) -> String {
    let mut rendered = text.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
    }
    rendered
}

/// In-memory registry of templates, keyed by ID.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, NotificationTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any previous one with the same ID.
    pub fn register(&self, template: NotificationTemplate) {
        self.templates.write().insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<NotificationTemplate> {
        self.templates.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.templates.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_placeholders() {
        let template = NotificationTemplate::new(
            "payroll_ready",
            "Payroll ready",
            "Payroll for {{period}} is ready",
            "Hi {{name}}, payroll for {{period}} has been approved.",
        );

        let mut vars = HashMap::new();
        vars.insert("period".to_string(), "March 2026".to_string());
        vars.insert("name".to_string(), "Dana".to_string());

        let (subject, body) = template.render(&vars);
        assert_eq!(subject, "Payroll for March 2026 is ready");
        assert_eq!(body, "Hi Dana, payroll for March 2026 has been approved.");
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let template =
            NotificationTemplate::new("t", "T", "Hello {{name}}", "Due {{due_date}}");
        let (subject, body) = template.render(&HashMap::new());
        assert_eq!(subject, "Hello {{name}}");
        assert_eq!(body, "Due {{due_date}}");
    }

    #[test]
    fn test_registry_roundtrip() {
        let registry = TemplateRegistry::new();
        registry.register(NotificationTemplate::new("a", "A", "s", "b"));
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());

        // Same ID replaces.
        registry.register(NotificationTemplate::new("a", "A2", "s2", "b2"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().name, "A2");

        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }
}
