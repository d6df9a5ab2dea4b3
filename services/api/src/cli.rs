use crate::demo::{run_demo, DemoArgs};
use crate::server;
use clap::{Args, Parser, Subcommand};
use credit_ai::error::AppError;
use credit_ai::workflows::underwriting::{RuleEngine, RuleLimits};

#[derive(Parser, Debug)]
#[command(
    name = "Credit Underwriting Orchestrator",
    about = "Run and demonstrate the credit underwriting workflow from the command line",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Underwrite a sample application in-process and print the run
    Demo(DemoArgs),
    /// Print the rule catalogue as JSON
    Rules,
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Demo(args) => run_demo(args).await,
        Command::Rules => print_rules(),
    }
}

fn print_rules() -> Result<(), AppError> {
    let catalogue = RuleEngine::new(RuleLimits::default()).catalogue();
    let rendered = serde_json::to_string_pretty(&catalogue)
        .map_err(|err| AppError::Io(std::io::Error::other(err)))?;
    println!("{rendered}");
    Ok(())
}
