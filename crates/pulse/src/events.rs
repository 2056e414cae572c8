//! Buy-event intake. The ingress (webhook receiver, auth, rate limiting)
//! lives outside this process and hands us parsed events as JSON lines, one
//! per buy. The same pump serves live piping and offline replays; processing
//! is idempotent, so a restarted feed can safely resend.

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::processor::{BuyEvent, SignalProcessor};

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
    pub events: u64,
    pub skipped: u64,
    pub signals: u64,
    pub alerts: u64,
}

/// Drain buy events from `reader` through the full pipeline:
/// process -> enrich -> alert. Malformed lines and per-event failures are
/// logged and counted, never fatal.
pub async fn consume_events<R>(
    reader: R,
    processor: &SignalProcessor,
    skip_rug_failed: bool,
) -> Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = IngestSummary::default();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: BuyEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable buy event line");
                summary.skipped += 1;
                continue;
            }
        };
        summary.events += 1;

        let signals = match processor.process_buy_event(&event).await {
            Ok(signals) => signals,
            Err(e) => {
                tracing::warn!(tx = %event.tx_signature, error = %e, "event processing failed");
                summary.skipped += 1;
                continue;
            }
        };

        for signal in signals {
            summary.signals += 1;
            let enriched = processor.enrich_and_validate_signal(signal).await;
            match processor.create_alert(&enriched, skip_rug_failed).await {
                Ok(Some(_)) => summary.alerts += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "alert creation failed");
                }
            }
        }
    }

    tracing::info!(
        events = summary.events,
        skipped = summary.skipped,
        signals = summary.signals,
        alerts = summary.alerts,
        "event stream drained"
    );
    Ok(summary)
}

pub async fn run_stdin_ingest(
    processor: &SignalProcessor,
    skip_rug_failed: bool,
) -> Result<IngestSummary> {
    consume_events(BufReader::new(tokio::io::stdin()), processor, skip_rug_failed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::testing::{StaticMetadata, StaticRisk};
    use crate::enrichment::TokenMetadata;
    use crate::processor::SignalThresholds;
    use chrono::{TimeZone, Utc};
    use common::memstore::MemoryStore;
    use common::model::{Wallet, WalletSource};
    use std::sync::Arc;

    async fn processor() -> (Arc<MemoryStore>, SignalProcessor) {
        let store = MemoryStore::new();
        let stores = store.stores();
        let mut wallet = Wallet::new(
            "W1",
            WalletSource::Gmgn,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        );
        wallet.win_rate = 70.0;
        stores.wallets.upsert(wallet).await.unwrap();
        let processor = SignalProcessor::new(
            SignalThresholds::default(),
            stores,
            Arc::new(StaticMetadata::new(TokenMetadata::default())),
            Arc::new(StaticRisk::passing()),
        );
        (store, processor)
    }

    #[tokio::test]
    async fn test_consume_full_pipeline() {
        let (store, processor) = processor().await;
        let feed = concat!(
            r#"{"wallet_address":"W1","token_ca":"CA1","sol_amount":1.5,"token_amount":8000.0,"tx_signature":"s1","block_time":"2026-03-01T12:00:00Z","market_cap_sol":100.0,"total_supply":1000000.0}"#,
            "\n",
            "not json at all\n",
            "\n",
            r#"{"wallet_address":"NOBODY","token_ca":"CA1","sol_amount":9.0,"token_amount":9000.0,"tx_signature":"s2","block_time":"2026-03-01T12:01:00Z"}"#,
            "\n",
        );

        let summary = consume_events(feed.as_bytes(), &processor, true).await.unwrap();
        // The unknown-wallet event parses and is silently ignored by the core.
        assert_eq!(summary.events, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.signals, 1); // high conviction from W1
        assert_eq!(summary.alerts, 1);

        let alerts = store.stores().alerts.unsent(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].token_ca, "CA1");
    }

    #[tokio::test]
    async fn test_resent_feed_does_not_duplicate() {
        let (store, processor) = processor().await;
        let line = concat!(
            r#"{"wallet_address":"W1","token_ca":"CA1","sol_amount":1.5,"token_amount":8000.0,"tx_signature":"s1","block_time":"2026-03-01T12:00:00Z","market_cap_sol":100.0,"total_supply":1000000.0}"#,
            "\n"
        );

        consume_events(line.as_bytes(), &processor, true).await.unwrap();
        let replay = consume_events(line.as_bytes(), &processor, true).await.unwrap();
        assert_eq!(replay.signals, 0);
        assert_eq!(replay.alerts, 0);

        assert_eq!(store.stores().trades.for_wallet("W1").await.unwrap().len(), 1);
        assert_eq!(store.stores().alerts.unsent(10).await.unwrap().len(), 1);
    }
}
