//! `ExpiryScanner` (§4.4): a periodic sweep that expires `PENDING` sessions past their
//! `expiresAt`, independent of whether any chain activity is happening.
//!
//! Idempotent by construction: each tick asks the registry to expire everything due as
//! of "now", and the registry's own `PENDING` guard makes a repeat call on an
//! already-expired session a no-op.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::registry::RegistryHandle;
use crate::timestamp::UnixTimestamp;

pub struct ExpiryScanner {
    registry: RegistryHandle,
    interval: Duration,
    cancellation_token: CancellationToken,
}

impl ExpiryScanner {
    pub fn new(registry: RegistryHandle, interval: Duration, cancellation_token: CancellationToken) -> Self {
        Self {
            registry,
            interval,
            cancellation_token,
        }
    }

    pub async fn run(self) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "expiry scanner started");
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    tracing::info!("expiry scanner stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            let now = match UnixTimestamp::try_now() {
                Ok(now) => now,
                Err(err) => {
                    tracing::error!(error = %err, "system clock error, skipping expiry scan");
                    continue;
                }
            };
            self.registry.expire_due(now).await;
        }
    }
}
