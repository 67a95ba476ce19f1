//! Join a room and save the file offered there.

use anyhow::{anyhow, Context, Result};
use drop_client::{
    DirectorySinkProvider, FallbackSinkProvider, MemorySinkProvider, ReceiverEngine,
    ReceiverEvent, RelayConnection, SinkOutput, WsTransport,
};
use drop_core::Tunables;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{percent, SESSION_TIMEOUT};

/// Largest file held in memory when the download directory is unusable.
const MEMORY_FALLBACK_LIMIT: u64 = 512 * 1024 * 1024;

/// Run the receive command.
pub async fn run(relay_url: &str, code: &str, out_dir: &Path, tunables: Tunables) -> Result<()> {
    if let Err(e) = tokio::fs::create_dir_all(out_dir).await {
        tracing::warn!(dir = %out_dir.display(), error = %e, "cannot create download directory");
    }

    println!("Connecting to {relay_url}...");
    let connection = Arc::new(
        RelayConnection::connect(WsTransport::new(), relay_url, tunables.wait_timeout)
            .await
            .context("Failed to connect to relay")?,
    );
    let joined = connection
        .join_session(code, SESSION_TIMEOUT)
        .await
        .context("Failed to join room")?;
    println!("Joined room {}, waiting for the sender...", joined.code);

    let sinks = FallbackSinkProvider::new(
        DirectorySinkProvider::new(out_dir),
        MemorySinkProvider::new(MEMORY_FALLBACK_LIMIT),
    );
    let (engine, handle, mut events) =
        ReceiverEngine::new(Arc::clone(&connection), Arc::new(sinks), tunables);
    let task = engine.spawn();

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ReceiverEvent::Offered { metadata }) => {
                    println!("Receiving {} ({} bytes)", metadata.filename, metadata.total_size);
                }
                Some(ReceiverEvent::Progress { received, total, .. }) => {
                    print!("\r  {:>3}%  {}/{} bytes", percent(received, total), received, total);
                    let _ = std::io::stdout().flush();
                }
                Some(ReceiverEvent::Completed { output, .. }) => {
                    println!();
                    break save(output).await;
                }
                Some(ReceiverEvent::Failed { reason, .. }) => {
                    println!();
                    break Err(anyhow!("Transfer failed: {reason}"));
                }
                None => break Err(anyhow!("Connection to relay closed")),
            },
            _ = tokio::signal::ctrl_c() => {
                if handle.cancel_first("user cancelled").await.is_none() {
                    break Err(anyhow!("Cancelled"));
                }
            }
        }
    };

    handle.shutdown();
    let _ = task.await;
    let _ = connection.close().await;
    outcome
}

/// Report where the file went; a memory fallback is written to the
/// working directory.
async fn save(output: SinkOutput) -> Result<()> {
    match output {
        SinkOutput::File(path) => {
            println!("Saved to {}", path.display());
        }
        SinkOutput::Memory { filename, data } => {
            let path = fallback_path(&filename);
            tokio::fs::write(&path, &data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Saved to {}", path.display());
        }
    }
    Ok(())
}

fn fallback_path(filename: &str) -> PathBuf {
    Path::new(filename)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("download.bin"))
}
