//! Server-rendered chat page.

use crate::conversation::StoredMessage;
use crate::provider::ACCEPTED_MIME_TYPES;
use crate::turn::TurnContext;
use anyhow::Context;
use handlebars::Handlebars;
use serde::Serialize;

const INDEX_TEMPLATE: &str = include_str!("../templates/index.hbs");
const INDEX: &str = "index";

#[derive(Debug, Serialize)]
struct MessageView<'a> {
    role: &'static str,
    content: &'a str,
    has_image: bool,
}

#[derive(Debug, Serialize)]
struct AttemptView<'a> {
    source: &'a str,
    outcome: &'static str,
    description: &'static str,
    detail: Option<&'a str>,
    is_success: bool,
}

#[derive(Debug, Serialize)]
struct PageView<'a> {
    session_id: &'a str,
    session_short: &'a str,
    messages: Vec<MessageView<'a>>,
    rotation_log: Vec<AttemptView<'a>>,
    needs_personal_key: bool,
    has_personal_key: bool,
    accept: String,
}

/// Renders the chat page. All interpolated values are HTML-escaped.
pub struct PageRenderer {
    registry: Handlebars<'static>,
}

impl PageRenderer {
    pub fn new() -> anyhow::Result<Self> {
        let mut registry = Handlebars::new();
        registry
            .register_template_string(INDEX, INDEX_TEMPLATE)
            .context("Failed to register page template")?;
        Ok(Self { registry })
    }

    /// Render the page for a session.
    pub fn render(
        &self,
        ctx: &TurnContext,
        history: &[StoredMessage],
    ) -> atelier_common::Result<String> {
        let view = PageView {
            session_id: ctx.session_id.as_str(),
            session_short: ctx.session_id.short(),
            messages: history
                .iter()
                .map(|m| MessageView {
                    role: m.role.as_str(),
                    content: &m.content,
                    has_image: m.has_image,
                })
                .collect(),
            rotation_log: ctx
                .rotation_log
                .iter()
                .map(|e| AttemptView {
                    source: &e.source,
                    outcome: e.outcome.as_str(),
                    description: e.outcome.describe(),
                    detail: e.detail.as_deref(),
                    is_success: e.outcome.is_success(),
                })
                .collect(),
            needs_personal_key: ctx.needs_personal_key,
            has_personal_key: ctx.has_personal_key(),
            accept: ACCEPTED_MIME_TYPES.join(","),
        };

        self.registry
            .render(INDEX, &view)
            .map_err(|e| atelier_common::Error::Internal(format!("page render failed: {e}")))
    }
}
