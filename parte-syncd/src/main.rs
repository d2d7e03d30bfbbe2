use anyhow::Context;
use parte_syncd::daemon::{DaemonConfig, DaemonRuntime};
use parte_syncd::logging;
use parte_syncd::sync::store::EntityType;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    DownloadFull,
    DownloadIncremental,
    Sync,
    Status,
    List(EntityType),
    Outbox,
    Retry(i64),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        mode = match arg.as_str() {
            "--run" => CliMode::Run,
            "--download-full" => CliMode::DownloadFull,
            "--download-incremental" => CliMode::DownloadIncremental,
            "--sync" => CliMode::Sync,
            "--status" => CliMode::Status,
            "--outbox" => CliMode::Outbox,
            "--list" => {
                let raw = args.next().context("--list needs an entity type")?;
                CliMode::List(EntityType::parse(&raw)?)
            }
            "--retry" => {
                let raw = args.next().context("--retry needs a queue id")?;
                CliMode::Retry(
                    raw.parse()
                        .with_context(|| format!("invalid queue id: {raw}"))?,
                )
            }
            "--help" | "-h" => CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        };
    }
    Ok(mode)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_usage() {
    println!("Usage: parte-syncd [MODE]");
    println!("  --run                    Seed if needed, then pull and push until Ctrl-C (default)");
    println!("  --download-full          Download every entity type from scratch");
    println!("  --download-incremental   Pull changes since each cursor");
    println!("  --sync                   Push pending local operations once");
    println!("  --status                 Print outbox counters as JSON");
    println!("  --list <entity>          Print local estudantes, programas or designacoes");
    println!("  --outbox                 Print every queued operation");
    println!("  --retry <queue_id>       Move a failed operation back to pending");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    logging::init("parte_syncd=info")?;
    let config = DaemonConfig::from_env()?;

    match mode {
        CliMode::Run => DaemonRuntime::bootstrap(config).await?.run().await?,
        CliMode::DownloadFull => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let reports = daemon
                .engine()
                .download_full(&EntityType::ALL)
                .await
                .context("full download failed")?;
            print_json(&reports)?;
            daemon.engine().store().close().await;
        }
        CliMode::DownloadIncremental => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let reports = daemon
                .engine()
                .download_incremental()
                .await
                .context("incremental download failed")?;
            print_json(&reports)?;
            daemon.engine().store().close().await;
        }
        CliMode::Sync => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let result = daemon.engine().sync().await.context("sync failed")?;
            print_json(&result)?;
            daemon.engine().store().close().await;
        }
        CliMode::Status => {
            let store = config.open_store().await?;
            print_json(&store.outbox_status().await?)?;
            store.close().await;
        }
        CliMode::List(entity) => {
            let store = config.open_store().await?;
            print_json(&store.get_all(entity).await?)?;
            store.close().await;
        }
        CliMode::Outbox => {
            let store = config.open_store().await?;
            print_json(&store.list_ops().await?)?;
            store.close().await;
        }
        CliMode::Retry(queue_id) => {
            let store = config.open_store().await?;
            if !store.requeue_failed(queue_id).await? {
                anyhow::bail!("operation {queue_id} is not in the failed state");
            }
            println!("operation {queue_id} requeued");
            store.close().await;
        }
        CliMode::Help => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        std::iter::once("parte-syncd")
            .chain(raw.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_one_shot_commands() {
        assert_eq!(
            parse_cli_mode(args(&["--download-full"])).unwrap(),
            CliMode::DownloadFull
        );
        assert_eq!(
            parse_cli_mode(args(&["--download-incremental"])).unwrap(),
            CliMode::DownloadIncremental
        );
        assert_eq!(parse_cli_mode(args(&["--sync"])).unwrap(), CliMode::Sync);
        assert_eq!(parse_cli_mode(args(&["--status"])).unwrap(), CliMode::Status);
        assert_eq!(parse_cli_mode(args(&["-h"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_reads_list_entity() {
        assert_eq!(
            parse_cli_mode(args(&["--list", "designacoes"])).unwrap(),
            CliMode::List(EntityType::Designacoes)
        );
        assert!(parse_cli_mode(args(&["--list", "publicadores"])).is_err());
        assert!(parse_cli_mode(args(&["--list"])).is_err());
    }

    #[test]
    fn parse_cli_mode_reads_retry_queue_id() {
        assert_eq!(
            parse_cli_mode(args(&["--retry", "42"])).unwrap(),
            CliMode::Retry(42)
        );
        assert!(parse_cli_mode(args(&["--retry", "abc"])).is_err());
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(args(&["--logout"])).is_err());
    }
}
