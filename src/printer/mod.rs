//! Printers: markdown (termimad), colored text and JSON, each usable as a
//! session [`Presenter`].

use std::io::{self, Write};

use owo_colors::OwoColorize;
use serde::Serialize;
use termimad::MadSkin;

use crate::{
    execution::ExecutionOutcome,
    origin::{ResolveError, Snippet},
    session::{Presenter, Principal, SurfaceId},
};

pub const DENIAL: &str = "Only an authorized user can run this again.";

/// One labelled section per outcome field, already truncated.
struct Fields {
    code: String,
    console: String,
    value: String,
    error: String,
}

impl Fields {
    fn new(snippet: &Snippet, outcome: &ExecutionOutcome, limit: usize) -> Self {
        let shown = |text: Option<String>| truncate(text.as_deref().unwrap_or("None"), limit);
        Self {
            code: truncate(snippet.text(), limit),
            console: shown(outcome.console_output().map(str::to_string)),
            value: shown(outcome.return_value_text()),
            error: shown(outcome.error().map(ToString::to_string)),
        }
    }

    fn sections(&self) -> [(&'static str, &str); 4] {
        [
            ("Code That Executed", &self.code),
            ("Console Output", &self.console),
            ("Return Value", &self.value),
            ("Error", &self.error),
        ]
    }
}

/// Cuts `text` to `limit` characters, marking the cut with `…`.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn title(outcome: &ExecutionOutcome) -> &'static str {
    if outcome.is_success() {
        "✅ Success"
    } else {
        "❌ Error"
    }
}

pub fn render_markdown(snippet: &Snippet, outcome: &ExecutionOutcome, limit: usize) -> String {
    let fields = Fields::new(snippet, outcome, limit);
    let mut md = format!("## {}\n\n", title(outcome));
    for (label, body) in fields.sections() {
        let lang = if label == "Code That Executed" { "js" } else { "" };
        md.push_str(&format!("**{label}:**\n```{lang}\n{body}\n```\n\n"));
    }
    md
}

pub struct MarkdownPrinter {
    pub skin: MadSkin,
    pub field_limit: usize,
}

impl MarkdownPrinter {
    pub fn new(field_limit: usize) -> Self {
        Self { skin: MadSkin::default(), field_limit }
    }

    pub fn print(&self, text: &str) {
        self.skin.print_text(text);
        println!();
    }
}

impl Presenter for MarkdownPrinter {
    fn render(&mut self, _surface: &SurfaceId, snippet: &Snippet, outcome: &ExecutionOutcome) {
        self.print(&render_markdown(snippet, outcome, self.field_limit));
    }

    fn deny(&mut self, _surface: &SurfaceId, _principal: &Principal) {
        eprintln!("❌ {DENIAL}");
    }

    fn resolution_failed(&mut self, _surface: &SurfaceId, error: &ResolveError) {
        eprintln!("❌ {error}");
    }
}

pub struct TextPrinter {
    pub field_limit: usize,
}

impl Presenter for TextPrinter {
    fn render(&mut self, _surface: &SurfaceId, snippet: &Snippet, outcome: &ExecutionOutcome) {
        let heading = title(outcome);
        if outcome.is_success() {
            println!("{}", heading.green());
        } else {
            println!("{}", heading.red());
        }
        for (label, body) in Fields::new(snippet, outcome, self.field_limit).sections() {
            println!("{}\n{}\n", format!("{label}:").cyan(), body);
        }
    }

    fn deny(&mut self, _surface: &SurfaceId, _principal: &Principal) {
        eprintln!("{}", DENIAL.red());
    }

    fn resolution_failed(&mut self, _surface: &SurfaceId, error: &ResolveError) {
        eprintln!("{}", error.to_string().red());
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonRender<'a> {
    surface: &'a str,
    code: &'a str,
    outcome: &'a ExecutionOutcome,
}

/// One JSON document per render on stdout; denials and failures go to
/// stderr so stdout stays machine-readable.
pub struct JsonPrinter;

impl Presenter for JsonPrinter {
    fn render(&mut self, surface: &SurfaceId, snippet: &Snippet, outcome: &ExecutionOutcome) {
        let doc = JsonRender { surface: surface.as_str(), code: snippet.text(), outcome };
        match serde_json::to_string(&doc) {
            Ok(line) => {
                let mut out = io::stdout().lock();
                let _ = writeln!(out, "{line}");
            }
            Err(e) => eprintln!("failed to encode outcome: {e}"),
        }
    }

    fn deny(&mut self, _surface: &SurfaceId, _principal: &Principal) {
        eprintln!("{DENIAL}");
    }

    fn resolution_failed(&mut self, _surface: &SurfaceId, error: &ResolveError) {
        eprintln!("{error}");
    }
}

/// The presenter picked from CLI flags and config.
pub enum CliPrinter {
    Markdown(MarkdownPrinter),
    Text(TextPrinter),
    Json(JsonPrinter),
}

impl Presenter for CliPrinter {
    fn render(&mut self, surface: &SurfaceId, snippet: &Snippet, outcome: &ExecutionOutcome) {
        match self {
            CliPrinter::Markdown(p) => p.render(surface, snippet, outcome),
            CliPrinter::Text(p) => p.render(surface, snippet, outcome),
            CliPrinter::Json(p) => p.render(surface, snippet, outcome),
        }
    }

    fn deny(&mut self, surface: &SurfaceId, principal: &Principal) {
        match self {
            CliPrinter::Markdown(p) => p.deny(surface, principal),
            CliPrinter::Text(p) => p.deny(surface, principal),
            CliPrinter::Json(p) => p.deny(surface, principal),
        }
    }

    fn resolution_failed(&mut self, surface: &SurfaceId, error: &ResolveError) {
        match self {
            CliPrinter::Markdown(p) => p.resolution_failed(surface, error),
            CliPrinter::Text(p) => p.resolution_failed(surface, error),
            CliPrinter::Json(p) => p.resolution_failed(surface, error),
        }
    }
}
