//! poll-sync-watch: 通过完整的同步栈轮询一个 HTTP 端点并打印每次发布的快照
//!
//! Usage:
//!   poll-sync-watch <base-url> <endpoint> [--interval-ms N] [--config <path>] [--stats-every N]

use anyhow::{bail, Context};
use poll_sync::config::SyncConfig;
use poll_sync::orchestrator::SyncRuntime;
use poll_sync::transport::HttpFetcher;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Args {
    base_url: String,
    endpoint: String,
    interval: Option<Duration>,
    config: Option<String>,
    stats_every: u32,
}

fn print_usage() {
    println!(
        r#"poll-sync-watch: 轮询同步观察工具

USAGE:
    poll-sync-watch <BASE_URL> <ENDPOINT> [OPTIONS]

OPTIONS:
    --interval-ms <N>     Override the poll interval
    --config <path>       YAML config file (env knobs still apply)
    --stats-every <N>     Print stats after every N published snapshots (default 10)
    -h, --help            Show this help message

ENVIRONMENT:
    POLL_SYNC_ENV                 development | test | staging | production
    POLL_SYNC_DEBUG               Enable diagnostics
    POLL_SYNC_DEBUG_LEVEL         off | error | warn | info | verbose
    POLL_SYNC_SHOW_HASH_CHANGES   Log changed fields on every hash change
    POLL_SYNC_DISABLED            Start with the kill switch engaged
    POLL_SYNC_TOKEN               Bearer token sent with every request"#
    );
}

fn parse_args(raw: &[String]) -> anyhow::Result<Option<Args>> {
    if raw.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(None);
    }
    let mut positional = Vec::new();
    let mut interval = None;
    let mut config = None;
    let mut stats_every = 10;

    let mut it = raw.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--interval-ms" => {
                let v = it.next().context("--interval-ms needs a value")?;
                let ms: u64 = v.parse().with_context(|| format!("invalid interval: {v}"))?;
                if ms == 0 {
                    bail!("--interval-ms must be greater than zero");
                }
                interval = Some(Duration::from_millis(ms));
            }
            "--config" => {
                config = Some(it.next().context("--config needs a path")?.clone());
            }
            "--stats-every" => {
                let v = it.next().context("--stats-every needs a value")?;
                stats_every = v.parse().with_context(|| format!("invalid count: {v}"))?;
            }
            other if other.starts_with("--") => bail!("unknown option: {other}"),
            other => positional.push(other.to_string()),
        }
    }

    let [base_url, endpoint] = <[String; 2]>::try_from(positional)
        .map_err(|_| anyhow::anyhow!("expected <BASE_URL> <ENDPOINT>"))?;
    Ok(Some(Args {
        base_url,
        endpoint,
        interval,
        config,
        stats_every: stats_every.max(1),
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(Some(a)) => a,
        Ok(None) => {
            print_usage();
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!();
            print_usage();
            std::process::exit(2);
        }
    };

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => SyncConfig::default(),
    };
    config.apply_env();
    poll_sync::logging::init_tracing(&config.debug);

    let fetcher = HttpFetcher::new(&args.base_url).context("building HTTP fetcher")?;
    let runtime = SyncRuntime::from_config(config, Arc::new(fetcher));

    let cancel = CancellationToken::new();
    runtime.spawn_maintenance(cancel.clone());

    let mut builder = runtime.orchestrator(&args.endpoint).with_label("poll-sync-watch");
    if let Some(interval) = args.interval {
        builder = builder.with_interval(interval);
    }
    let orchestrator = builder.build()?;

    let mut updates = orchestrator.subscribe();
    if orchestrator.start().is_none() {
        bail!("could not start a synchronizer for {}", args.endpoint);
    }
    println!(
        "watching {}{} every {} ms (ctrl-c to stop)",
        args.base_url,
        args.endpoint,
        orchestrator.interval().as_millis()
    );

    let mut published = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if let Some(data) = snapshot {
                    published += 1;
                    println!("{}", serde_json::to_string_pretty(&*data)?);
                    if published % args.stats_every == 0 {
                        println!("{}", serde_json::to_string_pretty(&orchestrator.get_system_stats())?);
                    }
                }
            }
        }
    }

    orchestrator.stop();
    cancel.cancel();
    println!("{}", serde_json::to_string_pretty(&orchestrator.get_system_stats())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        let a = parse_args(&args(&["http://x", "/api/sessions", "--interval-ms", "250"]))
            .unwrap()
            .unwrap();
        assert_eq!(a.endpoint, "/api/sessions");
        assert_eq!(a.interval, Some(Duration::from_millis(250)));
        assert_eq!(a.stats_every, 10);

        assert!(parse_args(&args(&["--help"])).unwrap().is_none());
        assert!(parse_args(&args(&["http://x"])).is_err());
        assert!(parse_args(&args(&["http://x", "/a", "--interval-ms", "0"])).is_err());
    }
}
