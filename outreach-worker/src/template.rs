//! Placeholder substitution for message templates.
//!
//! Templates contain `{field}` tokens. Each token is replaced with the
//! recipient's value for that field, or with a channel default when the
//! recipient has none. Substituted values are never re-scanned.

use std::collections::BTreeMap;

use crate::types::{Channel, MessageTemplate, OutboundMessage, Recipient};

/// Defaults used when a recipient lacks a field.
const CHANNEL_DEFAULTS: &[(&str, &str)] = &[
    ("name", "Athlete"),
    ("sport", "your sport"),
    ("position", "athlete"),
    ("school", "your school"),
    ("state", "your state"),
];

/// Replace every `{key}` in `template`.
///
/// Lookup order is `fields`, then `defaults`. A token with no value in
/// either map is copied through verbatim, as is an unterminated `{`.
pub fn render(
    template: &str,
    fields: &BTreeMap<String, String>,
    defaults: &BTreeMap<String, String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let key = &after[..close];
        if !is_placeholder_key(key) {
            // Not a token; emit the brace and keep scanning after it.
            out.push('{');
            rest = after;
            continue;
        }

        match fields.get(key).or_else(|| defaults.get(key)) {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Channel-aware renderer.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    channel: Channel,
    defaults: BTreeMap<String, String>,
}

impl TemplateRenderer {
    pub fn for_channel(channel: Channel) -> Self {
        let defaults = CHANNEL_DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Self { channel, defaults }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Render a single template string with channel defaults applied.
    ///
    /// A blank `name` counts as missing. On SMS only the first word of
    /// `name` is used.
    pub fn render(&self, template: &str, fields: &BTreeMap<String, String>) -> String {
        let name = fields.get("name").map(|n| n.trim());

        let replacement = match name {
            Some("") => None,
            Some(n) if self.channel == Channel::Sms => n.split_whitespace().next(),
            _ => return render(template, fields, &self.defaults),
        };

        let mut fields = fields.clone();
        match replacement {
            Some(first) => {
                fields.insert("name".to_string(), first.to_string());
            }
            None => {
                fields.remove("name");
            }
        }
        render(template, &fields, &self.defaults)
    }

    /// Produce the per-recipient message for a campaign template.
    pub fn render_for(&self, template: &MessageTemplate, recipient: &Recipient) -> OutboundMessage {
        let fields = recipient.template_fields();

        OutboundMessage {
            subject: template
                .subject
                .as_deref()
                .map(|s| self.render(s, &fields)),
            body: self.render(&template.body, &fields),
        }
    }
}
