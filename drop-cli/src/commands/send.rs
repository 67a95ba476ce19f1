//! Offer one file under a room code.

use anyhow::{anyhow, Context, Result};
use drop_client::{FileSource, RelayConnection, SenderEngine, TransferError, WsTransport};
use drop_core::Tunables;
use drop_types::{SessionCode, DEFAULT_CODE_LEN};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use super::{percent, SESSION_TIMEOUT};

/// Run the send command.
pub async fn run(relay_url: &str, path: &Path, code: Option<&str>, tunables: Tunables) -> Result<()> {
    let source = FileSource::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let code = match code {
        Some(raw) => SessionCode::parse(raw).map_err(|e| anyhow!("Invalid room code: {e}"))?,
        None => SessionCode::generate(DEFAULT_CODE_LEN),
    };

    println!("Connecting to {relay_url}...");
    let connection = Arc::new(
        RelayConnection::connect(WsTransport::new(), relay_url, tunables.wait_timeout)
            .await
            .context("Failed to connect to relay")?,
    );
    let code = connection
        .create_session(&code, SESSION_TIMEOUT)
        .await
        .context("Failed to open room")?;

    println!();
    println!("  Room code: {code}");
    println!();
    println!("Waiting for a receiver...");
    let receiver = connection
        .wait_for_receiver(None)
        .await
        .context("Relay closed before a receiver joined")?;
    tracing::debug!(%receiver, "receiver joined");

    println!("Sending {} ({} bytes)", source.filename(), source.size());
    let handle = SenderEngine::new(Arc::clone(&connection), tunables).start(receiver, source);

    let mut progress = handle.progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            print!("\r  {:>3}%  {}/{} bytes", percent(p.sent, p.total), p.sent, p.total);
            let _ = std::io::stdout().flush();
        }
    });

    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = handle.wait().await;
    interrupt.abort();
    reporter.abort();
    println!();
    let _ = connection.close().await;

    match outcome {
        Ok(report) => {
            println!("Transfer complete: {} bytes delivered", report.bytes);
            Ok(())
        }
        Err(TransferError::Aborted(reason)) => Err(anyhow!("Transfer aborted: {reason}")),
        Err(e) => Err(e.into()),
    }
}
