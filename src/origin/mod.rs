//! Where a snippet comes from, and turning that into runnable text.

use std::{fmt, path::PathBuf, time::Duration};

use reqwest::Client;
use tracing::debug;

use crate::config::Config;

/// Language tags accepted right after an opening fence on the same line.
const FENCE_TAGS: &[&str] = &["js", "javascript", "mjs", "cjs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnippetOrigin {
    Literal(String),
    /// Text fetched from a URL.
    Attachment(String),
    /// A stored message, read from disk on every resolution.
    Message(PathBuf),
}

impl fmt::Display for SnippetOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnippetOrigin::Literal(_) => f.write_str("literal"),
            SnippetOrigin::Attachment(url) => write!(f, "attachment {url}"),
            SnippetOrigin::Message(path) => write!(f, "message {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("You must provide a command to run.")]
    Missing,
    #[error("Error fetching attachment: {0}")]
    Fetch(String),
    #[error("Error fetching attachment: {url} returned {status}")]
    Status { url: String, status: u16 },
    #[error("Error fetching message: {0}")]
    Read(String),
    #[error("The command is empty.")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    text: String,
    origin: SnippetOrigin,
}

impl Snippet {
    /// Strips a surrounding code fence, trims, and rejects empty text.
    pub fn parse(raw: &str, origin: SnippetOrigin) -> Result<Self, ResolveError> {
        let text = strip_fences(raw);
        if text.is_empty() {
            return Err(ResolveError::Empty);
        }
        Ok(Self { text: text.to_string(), origin })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> &SnippetOrigin {
        &self.origin
    }
}

impl AsRef<str> for Snippet {
    fn as_ref(&self) -> &str {
        &self.text
    }
}

fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.split_once('\n') {
            // Opening fence on its own line, optionally tagged.
            Some((first, body)) if is_tag(first.trim()) => body,
            _ => FENCE_TAGS
                .iter()
                .find_map(|tag| {
                    rest.strip_prefix(tag)
                        .filter(|after| after.starts_with(char::is_whitespace))
                })
                .unwrap_or(rest),
        };
    }
    text.strip_suffix("```").unwrap_or(text).trim()
}

fn is_tag(word: &str) -> bool {
    word.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '.'))
}

/// Fetches snippet text. Nothing is cached: every call reads the origin
/// again.
#[derive(Debug, Clone)]
pub struct Resolver {
    http: Client,
}

impl Resolver {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        // Honor REQUEST_TIMEOUT if present; default 60s
        let timeout_secs = cfg.get_u64("REQUEST_TIMEOUT").unwrap_or(60);
        Self::new(Duration::from_secs(timeout_secs))
    }

    pub async fn resolve(&self, origin: &SnippetOrigin) -> Result<Snippet, ResolveError> {
        let raw = match origin {
            SnippetOrigin::Literal(text) => text.clone(),
            SnippetOrigin::Attachment(url) => self.fetch(url).await?,
            SnippetOrigin::Message(path) => tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ResolveError::Read(format!("{}: {e}", path.display())))?,
        };
        debug!(%origin, bytes = raw.len(), "resolved snippet");
        Snippet::parse(&raw, origin.clone())
    }

    async fn fetch(&self, url: &str) -> Result<String, ResolveError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ResolveError::Status { url: url.to_string(), status: status.as_u16() });
        }
        resp.text().await.map_err(|e| ResolveError::Fetch(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parsed(raw: &str) -> Result<String, ResolveError> {
        Snippet::parse(raw, SnippetOrigin::Literal(raw.to_string())).map(|s| s.text().to_string())
    }

    #[test]
    fn strips_fences() {
        assert_eq!(parsed("```js\nreturn 1;\n```"), Ok("return 1;".to_string()));
        assert_eq!(parsed("```\nreturn 1;\n```"), Ok("return 1;".to_string()));
        assert_eq!(parsed("```js return 1;```"), Ok("return 1;".to_string()));
        assert_eq!(parsed("```return 1;```"), Ok("return 1;".to_string()));
        assert_eq!(parsed("  return `a`;  "), Ok("return `a`;".to_string()));
    }

    #[test]
    fn fence_only_is_empty() {
        assert_eq!(parsed("```js\n```"), Err(ResolveError::Empty));
        assert_eq!(parsed("   "), Err(ResolveError::Empty));
    }
}
