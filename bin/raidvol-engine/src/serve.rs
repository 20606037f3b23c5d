//! JSON-lines request loop

use anyhow::Result;
use raidvol_engine::Facade;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

/// Serve requests from stdin until end of input
pub async fn serve_stdio(facade: &Facade) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let handled = serve(facade, stdin, stdout).await?;
    info!("Input closed after {handled} request(s)");
    Ok(())
}

/// Answer each non-empty line of `input` with one line on `output`.
/// Returns the number of requests handled.
pub async fn serve<R, W>(facade: &Facade, input: R, mut output: W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut handled = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut response = facade.handle_line(line).await;
        response.push('\n');
        output.write_all(response.as_bytes()).await?;
        output.flush().await?;
        handled += 1;
    }
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use raidvol_common::Config;
    use raidvol_common::config::EngineConfig;
    use raidvol_engine::{EngineDeps, EngineRegistry, LocalDataPlane};
    use raidvol_meta_store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_serve_answers_each_line() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            engine: EngineConfig {
                sync_poll_interval_ms: 1,
                ..EngineConfig::default()
            },
            ..Config::default()
        });
        let plane = Arc::new(LocalDataPlane::new(dir.path(), config.frontend.clone()));
        let registry = Arc::new(EngineRegistry::new(EngineDeps {
            driver: plane.clone(),
            plane,
            store: Arc::new(MemoryStore::new()),
            config,
        }));
        let facade = Facade::new(registry, 1024 * 1024);

        let input = concat!(
            r#"{"op":"create_engine","volume_id":"v1","replica_addresses":["a"],"raid_level":"raid0"}"#,
            "\n\n",
            r#"{"op":"get_status","volume_id":"v1"}"#,
            "\n",
            r#"{"op":"add_replica","volume_id":"v1","replica_address":"b"}"#,
            "\n",
        );
        let mut output = Vec::new();
        let handled = serve(&facade, input.as_bytes(), &mut output).await.unwrap();
        assert_eq!(handled, 3);

        let responses: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses[0]["state"], "healthy");
        assert_eq!(responses[1]["raid_level"], "raid0");
        assert_eq!(responses[2]["kind"], "invalid_argument");
    }
}
