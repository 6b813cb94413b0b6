use super::notifier::{NotificationEvent, NotificationProvider};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Client;
use serde_json::json;
use url::Url;

const MESSAGE_LIMIT: usize = 2000;

pub(crate) struct DiscordWebhookProvider {
    webhook_url: Url,
    client: Client,
}

impl DiscordWebhookProvider {
    pub(crate) fn new(webhook_url: Url) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .context("failed to build discord http client")?;

        Ok(Self {
            webhook_url,
            client,
        })
    }
}

fn format_content(event: &NotificationEvent) -> String {
    let mut lines = Vec::new();

    let headline = if event.security_event {
        format!("{} (security)", event.level.as_str())
    } else {
        event.level.as_str().to_string()
    };
    lines.push(format!(
        "**{}** `{}` `{}` `{}`",
        event.service_name, event.environment, event.component, headline
    ));

    lines.push(format!(
        "`{}` `{}`{}",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        event.target,
        match (&event.file, event.line) {
            (Some(file), Some(line)) => format!(" `{file}:{line}`"),
            _ => String::new(),
        }
    ));

    if let Some(message) = event.message.as_ref().filter(|m| !m.trim().is_empty()) {
        lines.push(format!("> {}", message.trim()));
    }

    if !event.fields.is_empty() {
        lines.push("fields:".to_string());
        for (key, value) in &event.fields {
            lines.push(format!("- `{key}` = `{value}`"));
        }
    }

    for span in &event.spans {
        if span.fields.is_empty() {
            continue;
        }
        lines.push(format!("span `{}`:", span.name));
        for (key, value) in &span.fields {
            lines.push(format!("- `{key}` = `{value}`"));
        }
    }

    truncate_for_discord(lines.join("\n"))
}

#[async_trait]
impl NotificationProvider for DiscordWebhookProvider {
    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .client
            .post(self.webhook_url.clone())
            .json(&json!({ "content": format_content(event) }))
            .send()
            .await
            .map_err(sanitize_reqwest_error)?;

        if response.status().is_success() {
            return Ok(());
        }

        Err(anyhow!(
            "discord webhook returned non-success status: {}",
            response.status()
        ))
    }

    fn provider_name(&self) -> &'static str {
        "discord"
    }
}

/// reqwest errors embed the request URL, which carries the webhook token.
fn sanitize_reqwest_error(error: reqwest::Error) -> anyhow::Error {
    if error.is_timeout() {
        return anyhow!("discord webhook request timed out");
    }
    if error.is_connect() {
        return anyhow!("discord webhook connection failed");
    }
    anyhow!("discord webhook request failed")
}

fn truncate_for_discord(content: String) -> String {
    const SUFFIX: &str = "\n… (truncated)";

    if content.chars().count() <= MESSAGE_LIMIT {
        return content;
    }

    let allowed = MESSAGE_LIMIT.saturating_sub(SUFFIX.chars().count());
    let mut truncated: String = content.chars().take(allowed).collect();
    truncated.push_str(SUFFIX);
    truncated
}
