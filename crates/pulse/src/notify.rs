//! Alert delivery. The chat transport is an external collaborator; the
//! engine only guarantees an alert is marked sent after the sink succeeds.

use anyhow::Result;
use async_trait::async_trait;

use common::model::{Alert, Token, WalletBrief};

use crate::processor::SignalProcessor;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, alert: &Alert, token: &Token, wallets: &[WalletBrief]) -> Result<()>;
}

/// Sink that renders alerts into the structured log. Useful headless and in
/// tests; production swaps in a chat transport behind the same trait.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, alert: &Alert, token: &Token, wallets: &[WalletBrief]) -> Result<()> {
        tracing::info!(
            alert_id = alert.id,
            kind = alert.alert_type.as_str(),
            token = %token.contract_address,
            symbol = token.display_symbol(),
            sol_volume = alert.total_sol_volume,
            wallets = wallets.len(),
            avg_win_rate = alert.avg_win_rate,
            "ALERT"
        );
        Ok(())
    }
}

/// Deliver unsent alerts oldest-first and mark each sent only after the sink
/// accepts it. A sink failure leaves the alert unsent for the next cycle.
pub async fn dispatch_unsent(
    processor: &SignalProcessor,
    sink: &dyn NotificationSink,
    limit: usize,
) -> Result<u64> {
    let pending = processor.pending_alerts(limit).await?;
    let mut delivered = 0_u64;
    for alert in pending {
        let Some(token) = processor.stores().tokens.get(&alert.token_ca).await? else {
            tracing::warn!(alert_id = alert.id, token = %alert.token_ca, "alert without token");
            continue;
        };
        let wallets = alert.trigger_wallets();
        match sink.deliver(&alert, &token, &wallets).await {
            Ok(()) => {
                processor.mark_alert_sent(alert.id).await?;
                delivered += 1;
                metrics::counter!("pulse_alerts_delivered_total").increment(1);
            }
            Err(e) => {
                tracing::warn!(alert_id = alert.id, error = %e, "delivery failed, will retry");
            }
        }
    }
    Ok(delivered)
}
