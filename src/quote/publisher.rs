use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::PublisherConfig;
use crate::error::{AttestationError, Error, TransferError};
use crate::transfer;
use crate::transport::tcp;

use super::{remove_if_present, CommandQuoteGenerator, Quote, QuoteGenerator};

/// Destination-side quote service.
///
/// Each [`publish`](Self::publish) call generates one fresh quote and serves
/// it to exactly one connecting peer in the background.
pub struct QuotePublisher {
    config: PublisherConfig,
    generator: Arc<dyn QuoteGenerator>,
}

impl QuotePublisher {
    pub fn new(config: PublisherConfig, generator: Arc<dyn QuoteGenerator>) -> Self {
        Self { config, generator }
    }

    /// Publisher that runs the configured generation program, writing to the
    /// configured quote path.
    pub fn from_config(config: PublisherConfig) -> Self {
        let generator = CommandQuoteGenerator::new(&config.generator, &config.quote_path)
            .args(config.generator_args.iter().cloned())
            .timeout(config.generation_timeout);
        Self::new(config, Arc::new(generator))
    }

    /// Generate a quote and start serving it.
    ///
    /// Returns once the listener is bound, so the incoming-migration path is
    /// not blocked on the source connecting. If generation fails no listener
    /// is started and incoming migration must not be initiated.
    pub async fn publish(&self) -> Result<PublishHandle, Error> {
        let path = self.generator.generate().await.map_err(|e| {
            tracing::warn!(error = %e, "quote generation failed");
            e
        })?;

        let quote = Quote::read_from(&path).await.map_err(|e| {
            AttestationError::QuoteGenerationFailed(format!(
                "cannot read {}: {e}",
                path.display()
            ))
        })?;

        let listener = tcp::listen(self.config.listen_addr).await.map_err(|e| {
            tracing::warn!(addr = %self.config.listen_addr, error = %e, "quote listener bind failed");
            e
        })?;
        let local_addr = listener.local_addr().map_err(TransferError::ConnectionFailed)?;

        tracing::info!(
            addr = %local_addr,
            quote_id = %quote.id(),
            bytes = quote.len(),
            "serving quote"
        );

        let serve_timeout = self.config.serve_timeout;
        let opts = self.config.transfer_options();
        let quote_id = quote.id().to_owned();
        let task = tokio::spawn(async move {
            let result =
                transfer::serve_once(listener, quote.bytes().clone(), serve_timeout, &opts).await;

            // A quote is never served twice.
            if let Err(e) = remove_if_present(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove served quote");
            }

            match &result {
                Ok(n) => tracing::info!(bytes = n, "quote transfer complete"),
                Err(e) => tracing::warn!(error = %e, "quote transfer failed"),
            }
            result
        });

        Ok(PublishHandle {
            local_addr,
            quote_id,
            task,
        })
    }
}

/// Handle to a quote transfer running in the background.
#[derive(Debug)]
pub struct PublishHandle {
    local_addr: SocketAddr,
    quote_id: String,
    task: JoinHandle<Result<u64, TransferError>>,
}

impl PublishHandle {
    /// Address the quote is being served on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn quote_id(&self) -> &str {
        &self.quote_id
    }

    /// Wait for the single transfer to finish. Returns the bytes sent.
    pub async fn wait(self) -> Result<u64, Error> {
        match self.task.await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(TransferError::Io(std::io::Error::other(e)).into()),
        }
    }

    /// Stop serving without waiting.
    pub fn abort(&self) {
        self.task.abort();
    }
}
