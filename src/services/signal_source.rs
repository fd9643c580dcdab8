use crate::models::violation::ViolationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Environmental condition watched during an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Fullscreen,
    Visibility,
}

impl SignalKind {
    pub fn violation_type(&self) -> ViolationType {
        match self {
            Self::Fullscreen => ViolationType::FullscreenExit,
            Self::Visibility => ViolationType::VisibilityExit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub kind: SignalKind,
    /// `true` when the condition holds again (fullscreen entered / page visible).
    pub compliant: bool,
    pub at: DateTime<Utc>,
}

/// A push-based source of environmental signals.
pub trait SignalSource: Send + Sync {
    /// Register a listener. The registration is removed when the subscription is dropped.
    fn subscribe(&self) -> SignalSubscription;
}

pub struct SignalSubscription {
    rx: mpsc::UnboundedReceiver<SignalEvent>,
    _registration: Registration,
}

impl SignalSubscription {
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalEvent> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for SignalSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSubscription")
            .field("id", &self._registration.id)
            .finish()
    }
}

type Listeners = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<SignalEvent>>>>;

struct Registration {
    id: u64,
    listeners: Listeners,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Signal source fed by callers, e.g. the HTTP routes relaying browser events.
#[derive(Clone, Default)]
pub struct ChannelSignalSource {
    listeners: Listeners,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl ChannelSignalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every live listener. Returns how many received it.
    pub fn publish(&self, event: SignalEvent) -> usize {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|_, tx| tx.send(event).is_ok());
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl SignalSource for ChannelSignalSource {
    fn subscribe(&self) -> SignalSubscription {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        SignalSubscription {
            rx,
            _registration: Registration {
                id,
                listeners: self.listeners.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: SignalKind, compliant: bool) -> SignalEvent {
        SignalEvent {
            kind,
            compliant,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let source = ChannelSignalSource::new();
        let mut sub = source.subscribe();

        source.publish(event(SignalKind::Fullscreen, false));
        source.publish(event(SignalKind::Visibility, false));

        assert_eq!(sub.recv().await.map(|e| e.kind), Some(SignalKind::Fullscreen));
        assert_eq!(sub.recv().await.map(|e| e.kind), Some(SignalKind::Visibility));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let source = ChannelSignalSource::new();
        let sub = source.subscribe();
        assert_eq!(source.listener_count(), 1);
        drop(sub);
        assert_eq!(source.listener_count(), 0);
        assert_eq!(source.publish(event(SignalKind::Fullscreen, false)), 0);
    }
}
