//! Tether Runtime
//!
//! Minimal host: boots a primary runtime with the demo module, evaluates a
//! script and prints its settled completion value as JSON.
//!
//! ```text
//! tether [--settings FILE] [--timeout SECONDS] (SCRIPT | -e SOURCE)
//! ```

mod demo;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tether_core::{AppContext, BridgeSettings};
use tether_script::QuickJsEngine;
use tracing_subscriber::EnvFilter;

const DEFAULT_SCRIPT: &str = r#"
const { Demo } = tether.modules;
const counter = new Demo.Counter(40);
counter.increment(null);
counter.increment(null);
Promise.all([Demo.slowEcho("echo", null), Demo.fetchValue("answer")])
  .then(([echo, fetched]) => ({ sum: Demo.add(1, 2), counter: counter.value, echo, fetched }));
"#;

#[derive(Debug, Default)]
struct Options {
    settings: Option<PathBuf>,
    timeout: Option<u64>,
    source: Option<String>,
    script: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--settings" => {
                options.settings = Some(args.next().context("--settings needs a path")?.into())
            }
            "--timeout" => {
                let seconds = args.next().context("--timeout needs a value")?;
                options.timeout = Some(seconds.parse().context("--timeout must be whole seconds")?);
            }
            "-e" => options.source = Some(args.next().context("-e needs a script")?),
            other if other.starts_with('-') => bail!("unknown option {other}"),
            other => {
                if options.script.replace(other.into()).is_some() {
                    bail!("only one script can be given");
                }
            }
        }
    }
    if options.source.is_some() && options.script.is_some() {
        bail!("pass either a script file or -e, not both");
    }
    Ok(options)
}

fn main() -> Result<()> {
    let options = parse_args(std::env::args().skip(1))?;

    let settings = match &options.settings {
        Some(path) => BridgeSettings::load(path)?,
        None => BridgeSettings::default(),
    }
    .with_env_overrides()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Tether v{}", tether_core::VERSION);

    let source = match (&options.source, &options.script) {
        (Some(source), _) => source.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        (None, None) => DEFAULT_SCRIPT.to_string(),
    };

    let app = AppContext::new(settings).context("failed to start the background executor")?;
    app.register_module(demo::module()?)?;

    let runtime = app.primary_runtime();
    runtime.install(QuickJsEngine::factory())?;
    tracing::info!(runtime = runtime.id(), "runtime installed");

    let timeout = Duration::from_secs(options.timeout.unwrap_or(30));
    let outcome = runtime.eval_async(&source, timeout);
    app.shutdown();

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value.to_json())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parses_inline_source() {
        let options = parse_args(args(&["--timeout", "5", "-e", "1 + 1"])).unwrap();
        assert_eq!(options.timeout, Some(5));
        assert_eq!(options.source.as_deref(), Some("1 + 1"));
        assert!(options.script.is_none());
    }

    #[test]
    fn rejects_conflicting_inputs() {
        assert!(parse_args(args(&["-e", "1", "main.js"])).is_err());
        assert!(parse_args(args(&["a.js", "b.js"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
        assert!(parse_args(args(&["--settings"])).is_err());
    }

    #[test]
    fn default_script_runs_against_the_demo_module() {
        let app = AppContext::new(BridgeSettings::default()).unwrap();
        app.register_module(demo::module().unwrap()).unwrap();
        let runtime = app.primary_runtime();
        runtime.install(QuickJsEngine::factory()).unwrap();

        let value = runtime
            .eval_async(DEFAULT_SCRIPT, Duration::from_secs(10))
            .unwrap()
            .to_json();
        assert_eq!(value["sum"], 3);
        assert_eq!(value["counter"], 42);
        assert_eq!(value["echo"], "echo");
        assert_eq!(value["fetched"]["value"], 42);
    }
}
