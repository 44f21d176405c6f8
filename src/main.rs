use anyhow::Result;
use clap::Parser;

use due_notify::{
    cli::{self, RootCommand},
    logging::{LogConfig, print_log_location},
    settings::Settings,
};

#[derive(Parser, Debug)]
#[command(
    name = "due-notify",
    about = "Due-date alarms and notifications for task lists",
    long_about = "Schedules alarms for tasks with due dates, delivers them through the best available notification tier and runs a periodic background due check.",
    version = env!("CARGO_PKG_VERSION"),
    author
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    quiet: bool,

    /// Print the log file location on exit
    #[arg(long = "show-log")]
    show_log: bool,

    #[command(subcommand)]
    command: RootCommand,
}

#[tokio::main]
async fn main() -> Result<()> {
    let logging = match LogConfig::from_env().and_then(|config| config.init()) {
        Ok(logging) => Some(logging),
        Err(err) => {
            eprintln!("warning: failed to initialize logging: {err:#}");
            None
        }
    };

    let cli = Cli::parse();
    let settings = Settings::load();
    let code = cli::run(cli.command, &settings, cli.json, cli.quiet).await;

    if let Some(logging) = logging {
        if cli.show_log {
            print_log_location(&logging.path);
        }
        // Flush the writer; process::exit skips destructors.
        drop(logging);
    }
    std::process::exit(code);
}
