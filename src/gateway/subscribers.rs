//! In-process event subscribers.
//!
//! Handlers are grouped by capability, one list each. Every handler call runs
//! in its own task so a panic is contained to that handler and that event.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;
use wagate_core::event::GatewayEvent;
use wagate_core::protocol::ProtocolEvent;

/// An async event handler.
pub type Handler = Arc<dyn Fn(GatewayEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Which events a handler wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Any,
    Connected,
    Disconnected,
    Message,
    Qr,
    PairSuccess,
    LoggedOut,
}

#[derive(Default)]
struct Lists {
    on_any: Vec<Handler>,
    on_connected: Vec<Handler>,
    on_disconnected: Vec<Handler>,
    on_message: Vec<Handler>,
    on_qr: Vec<Handler>,
    on_pair_success: Vec<Handler>,
    on_logged_out: Vec<Handler>,
}

impl Lists {
    fn list_mut(&mut self, capability: Capability) -> &mut Vec<Handler> {
        match capability {
            Capability::Any => &mut self.on_any,
            Capability::Connected => &mut self.on_connected,
            Capability::Disconnected => &mut self.on_disconnected,
            Capability::Message => &mut self.on_message,
            Capability::Qr => &mut self.on_qr,
            Capability::PairSuccess => &mut self.on_pair_success,
            Capability::LoggedOut => &mut self.on_logged_out,
        }
    }

    fn specific(&self, event: &ProtocolEvent) -> &[Handler] {
        match event {
            ProtocolEvent::Connected => &self.on_connected,
            ProtocolEvent::Disconnected { .. } => &self.on_disconnected,
            ProtocolEvent::Message(_) => &self.on_message,
            ProtocolEvent::Qr { .. } => &self.on_qr,
            ProtocolEvent::PairSuccess { .. } => &self.on_pair_success,
            ProtocolEvent::LoggedOut { .. } => &self.on_logged_out,
            _ => &[],
        }
    }
}

#[derive(Default)]
pub(crate) struct Subscribers {
    lists: RwLock<Lists>,
}

impl Subscribers {
    pub fn add(&self, capability: Capability, handler: Handler) {
        self.lists.write().list_mut(capability).push(handler);
    }

    /// Run every matching handler for `event`, in registration order,
    /// specific lists first. Returns how many handlers failed.
    pub async fn notify(&self, event: &GatewayEvent) -> usize {
        let handlers: Vec<Handler> = {
            let lists = self.lists.read();
            lists
                .specific(&event.event)
                .iter()
                .chain(lists.on_any.iter())
                .cloned()
                .collect()
        };

        let mut failed = 0;
        for handler in handlers {
            let event_for_handler = event.clone();
            let run = tokio::spawn(async move { handler(event_for_handler).await });
            if let Err(e) = run.await {
                failed += 1;
                if e.is_panic() {
                    warn!(
                        "session {}: subscriber panicked on {} event",
                        event.session_id,
                        event.event.name()
                    );
                } else {
                    warn!(
                        "session {}: subscriber task cancelled: {e}",
                        event.session_id
                    );
                }
            }
        }
        failed
    }
}
