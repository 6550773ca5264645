//! Client messages for the feed server, filled in from `${name}` templates.
//!
//! Every rendered message gets a fresh `message_id`. The counter is shared by
//! all templates so ids stay unique for the lifetime of the process; a template
//! that does not use the id still consumes one, which leaves harmless gaps.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("invalid placeholder at byte {0}")]
    InvalidPlaceholder(usize),

    #[error("no value for placeholder ${{{0}}}")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// A parsed template. `$$` is a literal dollar, `$name` and `${name}` are
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;
        let mut offset = 0;

        while let Some(dollar) = rest.find('$') {
            literal.push_str(&rest[..dollar]);
            let after = &rest[dollar + 1..];
            let at = offset + dollar;

            let (name, consumed) = if after.starts_with('$') {
                literal.push('$');
                (None, 1)
            } else if let Some(braced) = after.strip_prefix('{') {
                let close = braced.find('}').ok_or(TemplateError::Unterminated(at))?;
                let name = &braced[..close];
                if !is_identifier(name) {
                    return Err(TemplateError::InvalidPlaceholder(at));
                }
                (Some(name), close + 2)
            } else {
                let len = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                let name = &after[..len];
                if !is_identifier(name) {
                    return Err(TemplateError::InvalidPlaceholder(at));
                }
                (Some(name), len)
            };

            if let Some(name) = name {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(name.to_string()));
            }

            let skip = dollar + 1 + consumed;
            rest = &rest[skip..];
            offset += skip;
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Renders the template; `lookup` resolves every placeholder.
    pub fn render<'a, F>(&self, lookup: F) -> Result<String, TemplateError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value =
                        lookup(name).ok_or_else(|| TemplateError::MissingValue(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The set of client templates used during one process lifetime.
#[derive(Debug, Clone)]
pub struct Messenger {
    client_root: Template,
    subscribe: Option<Template>,
    resume_subscription: Option<Template>,
    last_processed: Option<Template>,
    mapping: BTreeMap<String, String>,
    next_message_id: u64,
}

impl Messenger {
    pub fn new(client_root: Template, mapping: BTreeMap<String, String>) -> Self {
        Self {
            client_root,
            subscribe: None,
            resume_subscription: None,
            last_processed: None,
            mapping,
            next_message_id: 0,
        }
    }

    pub fn with_subscribe(mut self, template: Template) -> Self {
        self.subscribe = Some(template);
        self
    }

    pub fn with_resume_subscription(mut self, template: Template) -> Self {
        self.resume_subscription = Some(template);
        self
    }

    pub fn with_last_processed(mut self, template: Template) -> Self {
        self.last_processed = Some(template);
        self
    }

    /// Whether a subscription request follows the client root tag.
    pub fn has_subscription_dialogue(&self) -> bool {
        self.subscribe.is_some()
    }

    /// Renders every template once without consuming message ids, so that
    /// a missing mapping entry is reported at startup instead of at runtime.
    pub fn check(&self) -> Result<(), (&'static str, TemplateError)> {
        let sample = [("on_message_id", "0"), ("last_processed_message_id", "0")];
        let named = [
            ("client_root", Some(&self.client_root)),
            ("subscribe", self.subscribe.as_ref()),
            ("resume_subscription", self.resume_subscription.as_ref()),
            ("last_processed", self.last_processed.as_ref()),
        ];
        for (name, template) in named {
            if let Some(template) = template {
                let extra: &[(&str, &str)] = if name == "last_processed" { &sample } else { &[] };
                self.fill(template, 0, extra).map_err(|e| (name, e))?;
            }
        }
        Ok(())
    }

    /// Root open tag sent right after connecting.
    pub fn client_root(&mut self) -> Result<Vec<u8>, TemplateError> {
        let template = self.client_root.clone();
        self.send(&template, &[])
    }

    /// Subscription request for a new connection, or `None` when the client
    /// root tag alone carries the subscription.
    pub fn subscription_request(&mut self, resume: bool) -> Result<Option<Vec<u8>>, TemplateError> {
        let template = match (&self.resume_subscription, &self.subscribe) {
            (Some(resume_template), Some(_)) if resume => resume_template.clone(),
            (_, Some(subscribe)) => subscribe.clone(),
            (_, None) => return Ok(None),
        };
        self.send(&template, &[]).map(Some)
    }

    /// Answer to a `LastProcessedMessageRequest`, if a template is configured.
    pub fn last_processed(&mut self, message_id: &str) -> Result<Option<Vec<u8>>, TemplateError> {
        let Some(template) = self.last_processed.clone() else {
            return Ok(None);
        };
        let extra = [
            ("on_message_id", message_id),
            ("last_processed_message_id", message_id),
        ];
        self.send(&template, &extra).map(Some)
    }

    fn send(
        &mut self,
        template: &Template,
        extra: &[(&str, &str)],
    ) -> Result<Vec<u8>, TemplateError> {
        let message_id = self.next_message_id;
        self.next_message_id += 1;
        let text = self.fill(template, message_id, extra)?;
        debug!("Sending: {}", text);
        Ok(text.into_bytes())
    }

    fn fill(
        &self,
        template: &Template,
        message_id: u64,
        extra: &[(&str, &str)],
    ) -> Result<String, TemplateError> {
        let message_id = message_id.to_string();
        template.render(|name| {
            if name == "message_id" {
                return Some(message_id.as_str());
            }
            extra
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
                .or_else(|| self.mapping.get(name).map(String::as_str))
        })
    }
}
