use clap::Parser;
use owo_colors::OwoColorize;
use std::path::MAIN_SEPARATOR;
use tracing_subscriber::EnvFilter;

mod cli;

const DEFAULT_LOG_FILTER: &str = "libmoodle=debug,moodle_dl=debug";

#[tokio::main]
async fn main() {
    let f_appender =
        tracing_appender::rolling::hourly(format!(".{}", MAIN_SEPARATOR), "moodle-dl.log");
    let (non_blk, _guard) = tracing_appender::non_blocking(f_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .event_format(tracing_subscriber::fmt::format().pretty())
        .with_writer(non_blk)
        .init();
    let cli = cli::Cli::parse();
    if let Err(e) = cli.run().await {
        tracing::error!("{}", e);
        println!("{}", e.red());
        drop(_guard);
        std::process::exit(1);
    }
}
