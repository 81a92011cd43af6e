//! JSON-lines trade source
//!
//! Parses one `Trade` per line and feeds the ingestion channel. Malformed
//! lines are skipped and counted; the stream only ends at EOF, on a
//! shutdown signal, or when the writer side has gone away.
//!
//! Trades of one source are committed in file order, so the trades an
//! interrupted run stored are always the first N parsed trades. Resuming
//! skips exactly those.

use super::runtime::IngestMessage;
use super::types::Trade;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub lines: u64,
    pub sent: u64,
    /// Malformed lines
    pub skipped: u64,
    /// Trades already stored by an earlier run
    pub resumed: u64,
    /// Reached end of input (not stopped by shutdown or a closed channel)
    pub completed: bool,
}

/// Open a trade file for `read_trades`
pub async fn open_trade_file(path: impl AsRef<Path>) -> std::io::Result<BufReader<File>> {
    let file = File::open(path.as_ref()).await?;
    log::info!("📖 Reading trades from {}", path.as_ref().display());
    Ok(BufReader::new(file))
}

/// Forward every parsed trade after the first `resume_after` into `tx`
///
/// Flipping `shutdown` to true stops reading after the current line.
/// Dropping `tx` on return is what closes the channel.
pub async fn read_trades<R>(
    reader: R,
    content_hash: Option<String>,
    resume_after: u64,
    tx: mpsc::Sender<IngestMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> ReadStats
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = ReadStats::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            next = lines.next_line() => next,
            Ok(()) = shutdown.changed() => continue,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                stats.completed = true;
                break;
            }
            Err(e) => {
                log::error!("❌ Failed to read trade source: {}", e);
                break;
            }
        };
        stats.lines += 1;

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let trade = match serde_json::from_str::<Trade>(line) {
            Ok(trade) => trade,
            Err(e) => {
                stats.skipped += 1;
                log::warn!("⚠️  Skipping malformed trade on line {}: {}", stats.lines, e);
                continue;
            }
        };

        if stats.resumed < resume_after {
            stats.resumed += 1;
            continue;
        }

        let message = IngestMessage {
            trade,
            content_hash: content_hash.clone(),
        };
        if tx.send(message).await.is_err() {
            log::warn!("⚠️  Ingestion channel closed, stopping reader");
            break;
        }
        stats.sent += 1;
    }

    log::info!(
        "📖 Trade source done: {} lines, {} sent, {} skipped, {} already stored",
        stats.lines,
        stats.sent,
        stats.skipped,
        stats.resumed
    );
    stats
}
