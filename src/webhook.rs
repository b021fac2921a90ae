//! Webhook delivery: a bounded queue drained by one background worker.
//!
//! The event path only ever calls [`WebhookQueue::enqueue`], which never
//! waits. The worker posts each envelope to every configured URL; failures
//! are logged and the envelope is dropped.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wagate_core::config::WebhookConfig;
use wagate_core::error::GatewayError;
use wagate_core::event::{WebhookEnvelope, WebhookSink};

/// Posts envelopes as JSON with `reqwest`.
pub struct HttpWebhookSink {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl HttpWebhookSink {
    pub fn new(config: &WebhookConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::Internal(format!("webhook client init failed: {e}")))?;
        Ok(Self {
            client,
            urls: config.urls.clone(),
        })
    }
}

#[async_trait]
impl WebhookSink for HttpWebhookSink {
    async fn deliver(&self, envelope: &WebhookEnvelope) -> Result<(), GatewayError> {
        let mut failures = Vec::new();
        for url in &self.urls {
            let result = self
                .client
                .post(url)
                .json(envelope)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            if let Err(e) = result {
                failures.push(format!("{url}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::ConnectionFailed(failures.join("; ")))
        }
    }
}

/// Producer side of the webhook queue.
#[derive(Clone)]
pub struct WebhookQueue {
    tx: mpsc::Sender<WebhookEnvelope>,
    config: Arc<WebhookConfig>,
}

impl WebhookQueue {
    /// Queue an envelope without waiting. Returns `false` if it was filtered
    /// out or dropped.
    pub fn enqueue(&self, envelope: WebhookEnvelope) -> bool {
        if !self.config.accepts(envelope.kind) {
            return false;
        }
        match self.tx.try_send(envelope) {
            Ok(()) => true,
            Err(TrySendError::Full(envelope)) => {
                warn!(
                    "session {}: webhook queue full, dropping {:?} event",
                    envelope.session_id, envelope.kind
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("webhook worker stopped, dropping event");
                false
            }
        }
    }
}

/// Start the delivery worker. The worker exits once every [`WebhookQueue`]
/// clone is dropped and the queue is drained.
pub fn spawn_worker(
    config: &WebhookConfig,
    sink: Arc<dyn WebhookSink>,
    buffer: usize,
) -> (WebhookQueue, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<WebhookEnvelope>(buffer);
    let handle = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = sink.deliver(&envelope).await {
                warn!(
                    "session {}: webhook delivery of {:?} failed: {e}",
                    envelope.session_id, envelope.kind
                );
            }
        }
        info!("webhook worker stopped");
    });
    let queue = WebhookQueue {
        tx,
        config: Arc::new(config.clone()),
    };
    (queue, handle)
}
