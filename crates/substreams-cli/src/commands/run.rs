use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use substreams_core::{EngineConfig, MemoryBlockSource, ValidatedPackage};
use substreams_host::{CancelToken, ExtensionRegistry};
use substreams_pipeline::{PipelineError, RequestModules, ResponseRx, response};
use substreams_service::{Request, Service};
use tracing::{info, warn};

use crate::output;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the package file
    pub package: PathBuf,
    /// Output modules to stream
    #[arg(required = true)]
    pub outputs: Vec<String>,
    /// First block to stream
    #[arg(short = 's', long, default_value_t = 0, allow_hyphen_values = true)]
    pub start_block: i64,
    /// Exclusive end block; 0 streams without end
    #[arg(short = 't', long, default_value_t = 0)]
    pub stop_block: u64,
    /// Resume after the block this cursor points at
    #[arg(short, long)]
    pub cursor: Option<String>,
    /// Serve [start, final) from cache and only stream live blocks fresh
    #[arg(long)]
    pub production: bool,
    /// Module params as module=value, repeatable or comma-separated
    #[arg(short, long, value_delimiter = ',', value_parser = parse_param)]
    pub params: Vec<(String, String)>,
    /// Apply the overrides of this network
    #[arg(short, long)]
    pub network: Option<String>,
    /// JSON-lines block file
    #[arg(long)]
    pub blocks: PathBuf,
    /// TOML file with an [engine] table
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Object store URL (file://, redb://, memory://)
    #[arg(long)]
    pub object_store_url: Option<String>,
    /// Parallel backfill workers
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Guest VM backend
    #[arg(long)]
    pub vm_backend: Option<String>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (module, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected module=value, got {s:?}"))?;
    if module.is_empty() {
        return Err(format!("missing module name in {s:?}"));
    }
    Ok((module.to_string(), value.to_string()))
}

/// Defaults, then the config file, then `SF_*` variables, then flags.
pub fn engine_config(args: &RunArgs) -> anyhow::Result<EngineConfig> {
    let base = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let mut engine = base.apply_env()?;
    if let Some(url) = &args.object_store_url {
        engine.object_store_url = Some(url.clone());
    }
    if let Some(workers) = args.max_workers {
        engine.max_workers = workers;
    }
    if let Some(backend) = &args.vm_backend {
        engine.vm_backend = backend.clone();
    }
    engine.validate()?;
    Ok(engine)
}

pub fn load_package(path: &Path, network: Option<&str>, params: &[(String, String)]) -> anyhow::Result<RequestModules> {
    let mut package = ValidatedPackage::from_file(path)?;
    package.apply_network(network)?;
    let params: BTreeMap<String, String> = params.iter().cloned().collect();
    package.apply_params(&params)?;
    let modules = RequestModules::from_package(&package)?;
    info!(package = %path.display(), modules = package.modules().len(), "package loaded");
    Ok(modules)
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let engine = engine_config(&args)?;
    let modules = Arc::new(load_package(&args.package, args.network.as_deref(), &args.params)?);
    let source = MemoryBlockSource::from_json_lines(&args.blocks)
        .with_context(|| format!("reading blocks from {}", args.blocks.display()))?;
    let service = Service::from_engine(engine, Arc::new(source), ExtensionRegistry::new())?;

    let (handle, cancel) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, canceling request");
            handle.cancel();
        }
    });

    let request = Request {
        outputs: args.outputs,
        start_block: args.start_block,
        stop_block: args.stop_block,
        cursor: args.cursor,
        production: args.production,
    };
    let (tx, rx) = response::channel();
    let printer = tokio::spawn(print_responses(rx));
    let result = service.handle(modules, request, tx, cancel).await;
    printer.await.context("response printer")??;

    match result {
        Ok(summary) => {
            info!(
                trace_id = %summary.trace_id,
                handoff = summary.handoff,
                jobs = summary.backfill.jobs,
                replayed = summary.replayed,
                "request completed"
            );
            Ok(())
        }
        Err(PipelineError::Canceled) => {
            info!("request canceled");
            Ok(())
        }
        Err(e) => {
            println!("{}", output::error_line(&e));
            Err(e.into())
        }
    }
}

async fn print_responses(mut rx: ResponseRx) -> anyhow::Result<()> {
    while let Some(response) = rx.recv().await {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", output::response_line(&response))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(config: Option<PathBuf>) -> RunArgs {
        RunArgs {
            package: "pkg.spkg".into(),
            outputs: vec!["map_a".into()],
            start_block: 0,
            stop_block: 0,
            cursor: None,
            production: false,
            params: Vec::new(),
            network: None,
            blocks: "blocks.jsonl".into(),
            config,
            object_store_url: Some("memory://".into()),
            max_workers: Some(3),
            vm_backend: None,
        }
    }

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(parse_param("m=a=b").unwrap(), ("m".into(), "a=b".into()));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "[engine]\nobject_store_url = \"file:///tmp/x\"\nmax_workers = 8\nsave_interval = 500\n",
        )
        .unwrap();
        let engine = engine_config(&args(Some(path))).unwrap();
        assert_eq!(engine.object_store_url.as_deref(), Some("memory://"));
        assert_eq!(engine.max_workers, 3);
        assert_eq!(engine.save_interval, 500);
    }

    #[test]
    fn missing_package_is_a_package_error() {
        let err = load_package(Path::new("/nonexistent/pkg.spkg"), None, &[]).unwrap_err();
        assert!(err.downcast_ref::<substreams_core::PackageError>().is_some());
    }
}
