use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::retry::{with_retry, RetryError};
use crate::config::SourceConfig;
use crate::error::{AttestationError, TransferError};
use crate::transfer::{self, TransferDescriptor};

use super::Quote;

/// Read the migration destination from the pinned target-address file.
///
/// The file holds one IP address or hostname; surrounding whitespace is
/// ignored, anything else is rejected.
pub async fn read_target_address(path: &Path) -> Result<String, AttestationError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        AttestationError::InvalidTargetAddress(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_target_address(&raw)
}

fn parse_target_address(raw: &str) -> Result<String, AttestationError> {
    let addr = raw.trim();
    if addr.is_empty() {
        return Err(AttestationError::InvalidTargetAddress(
            "target file is empty".into(),
        ));
    }
    let valid = addr
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if !valid {
        return Err(AttestationError::InvalidTargetAddress(format!(
            "malformed target {addr:?}"
        )));
    }
    Ok(addr.trim_start_matches('[').trim_end_matches(']').to_owned())
}

/// Source-side client for the destination's quote service.
pub struct QuoteFetcher<'a> {
    config: &'a SourceConfig,
}

impl<'a> QuoteFetcher<'a> {
    pub fn new(config: &'a SourceConfig) -> Self {
        Self { config }
    }

    /// Where the quote for `target` is fetched from.
    pub fn descriptor(&self, target: &str) -> TransferDescriptor {
        match self.config.quote_addr {
            Some(addr) => TransferDescriptor::receiver(addr.ip().to_string(), addr.port()),
            None => TransferDescriptor::receiver(target, self.config.quote_port),
        }
    }

    /// Pull the quote into `dest`, retrying within the configured budget.
    pub async fn fetch(
        &self,
        target: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Quote, AttestationError> {
        let descriptor = self.descriptor(target);
        let opts = self.config.fetch_options();
        let connect_timeout = self.config.connect_timeout;

        tracing::info!(%descriptor, "fetching destination quote");

        let descriptor = &descriptor;
        let opts = &opts;
        let result = with_retry(&self.config.retry_policy, cancel, || async move {
            transfer::receive_file(descriptor, dest, connect_timeout, opts).await?;
            Quote::read_from(dest).await.map_err(TransferError::Io)
        })
        .await;

        match result {
            Ok(quote) => {
                tracing::info!(quote_id = %quote.id(), bytes = quote.len(), "quote fetched");
                Ok(quote)
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => Err(AttestationError::QuoteUnavailable {
                attempts,
                last_error: last_error.to_string(),
            }),
            Err(RetryError::Cancelled { attempts }) => {
                tracing::warn!(attempts, "quote fetch cancelled");
                Err(AttestationError::Cancelled)
            }
        }
    }
}
