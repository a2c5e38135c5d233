use std::path::PathBuf;

use clap::{ArgGroup, Parser};

#[derive(Parser, Debug, Clone)]
#[command(name = "coderun", about = "Run JavaScript snippets in a time-bounded sandbox", version)]
#[command(group(ArgGroup::new("origin").args(["code", "file", "url"]).multiple(false)))]
#[command(group(ArgGroup::new("md_switch").args(["md", "no_md", "json"]).multiple(false)))]
pub struct Cli {
    /// The code to run. Reads stdin when omitted and stdin is not a terminal.
    #[arg(value_name = "CODE")]
    pub code: Option<String>,

    /// Read the code from a stored message file (re-read on every run).
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Fetch the code from a URL.
    #[arg(short = 'u', long)]
    pub url: Option<String>,

    /// Wall-clock limit for one run, in milliseconds.
    #[arg(short = 't', long = "timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Print each outcome as one JSON document.
    #[arg(long)]
    pub json: bool,

    /// Prettify output as Markdown.
    #[arg(long)]
    pub md: bool,
    /// Plain colored text output.
    #[arg(long = "no-md")]
    pub no_md: bool,

    /// Principal that triggers retries (default: $USER).
    #[arg(long)]
    pub principal: Option<String>,

    /// Run once and exit without offering a retry prompt.
    #[arg(long = "no-interaction")]
    pub no_interaction: bool,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
