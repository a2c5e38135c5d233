//! Run handler: resolve, execute, render, then offer interactive retries.

use std::{
    io::{self, Write},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Result};
use is_terminal::IsTerminal;
use serde_json::json;

use crate::{
    cli::Cli,
    config::{current_user, Config},
    execution::{Capability, ContextError, Coordinator, ExecutionContext, ExecutionLimits},
    origin::{ResolveError, Resolver, SnippetOrigin},
    printer::{CliPrinter, JsonPrinter, MarkdownPrinter, TextPrinter},
    session::{Authorization, Principal, RetrySession, Runner, SurfaceId},
};

pub async fn run(args: &Cli, cfg: &Config, stdin_code: Option<String>) -> Result<()> {
    let Some(origin) = origin_from(args, stdin_code) else {
        bail!("{}", ResolveError::Missing);
    };

    let mut limits = ExecutionLimits::from_config(cfg);
    if let Some(ms) = args.timeout_ms {
        limits = limits.with_timeout(Duration::from_millis(ms));
    }
    let principal = Principal::new(args.principal.clone().unwrap_or_else(current_user));
    let surface = SurfaceId::new(format!("cli-{}", std::process::id()));

    let runner = Runner::new(origin.clone(), Resolver::from_config(cfg)?, Coordinator::new(limits))
        .with_contexts({
            let principal = principal.clone();
            let surface = surface.clone();
            move |attempt| {
                cli_context(&principal, &surface, &origin, attempt)
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "falling back to an empty context");
                        ExecutionContext::new()
                    })
            }
        });

    let presenter = printer_for(args, cfg);
    let interactive = !args.no_interaction && !args.json && io::stdin().is_terminal();
    let Ok(mut session) = RetrySession::start(surface, Authorization::from_config(cfg), runner, presenter).await
    else {
        // Already reported through the presenter.
        return Ok(());
    };

    if !interactive {
        return Ok(());
    }

    // Interactive loop until quit
    loop {
        print!("[R]un again, [Q]uit: ");
        io::stdout().flush().ok();
        let mut choice = String::new();
        if io::stdin().read_line(&mut choice)? == 0 {
            break;
        }
        match choice.trim().to_lowercase().as_str() {
            "r" | "" => {
                session.trigger(&principal).await;
            }
            _ => break,
        }
    }

    Ok(())
}

fn origin_from(args: &Cli, stdin_code: Option<String>) -> Option<SnippetOrigin> {
    if let Some(path) = &args.file {
        return Some(SnippetOrigin::Message(path.clone()));
    }
    if let Some(url) = &args.url {
        return Some(SnippetOrigin::Attachment(url.clone()));
    }
    args.code
        .clone()
        .or(stdin_code)
        .filter(|code| !code.trim().is_empty())
        .map(SnippetOrigin::Literal)
}

fn printer_for(args: &Cli, cfg: &Config) -> CliPrinter {
    let limit = cfg.field_limit();
    let md = if args.no_md {
        false
    } else if args.md {
        true
    } else {
        cfg.get_bool("PRETTIFY_MARKDOWN")
    };
    if args.json {
        CliPrinter::Json(JsonPrinter)
    } else if md {
        CliPrinter::Markdown(MarkdownPrinter::new(limit))
    } else {
        CliPrinter::Text(TextPrinter { field_limit: limit })
    }
}

/// `invocation` describes who runs what; `clock` and `host` are the
/// modules reachable through `require`.
pub fn cli_context(
    principal: &Principal,
    surface: &SurfaceId,
    origin: &SnippetOrigin,
    attempt: u32,
) -> Result<ExecutionContext, ContextError> {
    let invocation = json!({
        "principal": principal.as_str(),
        "surface": surface.as_str(),
        "origin": origin.to_string(),
        "attempt": attempt,
    });
    let clock = Capability::object([(
        "now",
        Capability::function(|_| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| e.to_string())?;
            Ok(json!(now.as_millis() as u64))
        }),
    )]);
    let host = Capability::object([
        ("platform", Capability::value(std::env::consts::OS)),
        ("version", Capability::value(env!("CARGO_PKG_VERSION"))),
    ]);

    ExecutionContext::new()
        .with_binding("invocation", Capability::value(invocation))?
        .with_module("clock", clock)?
        .with_module("host", host)
}
