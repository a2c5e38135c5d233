use std::io::{self, Read};

use anyhow::Result;
use coderun::{cli, config::Config, handlers};
use is_terminal::IsTerminal;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    init_tracing();

    // Load config
    let cfg = Config::load();

    // stdin handling (pipe support) when no origin was given
    let mut stdin_code = None;
    if args.code.is_none() && args.file.is_none() && args.url.is_none() && !io::stdin().is_terminal() {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        stdin_code = Some(buf);
    }

    handlers::run::run(&args, &cfg, stdin_code).await
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("warn"))
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .try_init();
}
