use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::Level;
use tracing::warn;

const QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub(crate) struct SpanSummary {
    pub(crate) name: String,
    pub(crate) fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub(crate) struct NotificationEvent {
    pub(crate) level: Level,
    pub(crate) security_event: bool,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) service_name: String,
    pub(crate) environment: String,
    pub(crate) component: String,
    pub(crate) target: String,
    pub(crate) file: Option<String>,
    pub(crate) line: Option<u32>,
    pub(crate) message: Option<String>,
    pub(crate) fields: BTreeMap<String, String>,
    pub(crate) spans: Vec<SpanSummary>,
}

#[async_trait]
pub(crate) trait NotificationProvider: Send + Sync {
    async fn send(&self, event: &NotificationEvent) -> Result<()>;
    fn provider_name(&self) -> &'static str;
}

/// Hands events to a background task so logging never waits on the network.
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: mpsc::Sender<NotificationEvent>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    pub(crate) fn new(providers: Vec<Arc<dyn NotificationProvider>>) -> Self {
        let (tx, mut rx) = mpsc::channel::<NotificationEvent>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for provider in &providers {
                    if let Err(error) = provider.send(&event).await {
                        warn!(
                            provider = provider.provider_name(),
                            error = %error,
                            "observability: notification provider failed"
                        );
                    }
                }
            }
        });

        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn try_notify(&self, event: NotificationEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // Only the first drop of each hundred is logged.
                if dropped % 100 == 1 {
                    warn!(dropped, "observability: notification queue full; dropping events");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("observability: notification queue closed; dropping event");
            }
        }
    }
}
