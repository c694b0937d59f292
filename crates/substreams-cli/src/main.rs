use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use substreams_core::{ConfigError, PackageError, SourceError};
use substreams_pipeline::PipelineError;

mod commands;
mod output;

#[derive(Parser)]
#[command(
    name = "substreams",
    about = "Substreams — parallel block-streaming engine",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Log output format on stderr
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream module outputs for a block range.
    ///
    /// Responses are written to stdout as JSON lines. Engine settings are
    /// layered: defaults, then the [engine] table of --config, then SF_*
    /// environment variables, then flags.
    Run(commands::run::RunArgs),
    /// Print the module graph of a package
    Info {
        /// Path to the package file
        package: PathBuf,
        /// Apply the overrides of this network first
        #[arg(long)]
        network: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_format) {
        eprintln!("error: {e}");
        return ExitCode::from(1);
    }

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Info {
            package,
            network,
            format,
        } => commands::info::info(&package, network.as_deref(), &format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "request failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive("substreams=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

/// 2 bad arguments, 3 bad package, 4 upstream, 5 guest failure.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        return u8::try_from(e.exit_code()).unwrap_or(1);
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    if err.downcast_ref::<PackageError>().is_some() {
        return 3;
    }
    if err.downcast_ref::<SourceError>().is_some() {
        return 4;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_error_class() {
        let missing = anyhow::Error::new(ConfigError::Missing("SF_OBJECT_STORE_URL"));
        assert_eq!(exit_code(&missing), 2);
        assert_eq!(exit_code(&anyhow::Error::new(PipelineError::NoRecentFinal)), 4);
        assert_eq!(
            exit_code(&anyhow::Error::new(PipelineError::InvalidRequest("x".into()))),
            2
        );
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "substreams",
            "run",
            "pkg.spkg",
            "map_a",
            "store_b",
            "--start-block",
            "10",
            "--stop-block",
            "20",
            "--params",
            "map_a=x=1",
            "--blocks",
            "blocks.jsonl",
            "--production",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.outputs, vec!["map_a", "store_b"]);
        assert_eq!(args.start_block, 10);
        assert_eq!(args.stop_block, 20);
        assert!(args.production);
        assert_eq!(args.params, vec![("map_a".to_string(), "x=1".to_string())]);
    }
}
