use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{AvailabilityStatus, Ms};

const CHANNEL_CAPACITY: usize = 256;

/// A professional's resolved status changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub professional_id: Ulid,
    pub status: AvailabilityStatus,
    pub timestamp: Ms,
    pub next_change_at: Option<Ms>,
}

impl StatusChange {
    /// Payload handed to collaborators that store or forward notifications.
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "professionalId": self.professional_id.to_string(),
            "status": self.status.as_str(),
            "timestamp": self.timestamp,
            "nextChangeAt": self.next_change_at,
        })
        .to_string()
    }
}

/// Receives status changes. Called fire-and-forget: implementations must not
/// rely on the caller waiting.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn availability_changed(&self, change: StatusChange);
}

/// In-process broadcast hub: one channel per professional plus one for all.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<StatusChange>>,
    all: broadcast::Sender<StatusChange>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one professional. Creates the channel if needed.
    pub fn subscribe(&self, professional_id: Ulid) -> broadcast::Receiver<StatusChange> {
        let sender = self
            .channels
            .entry(professional_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<StatusChange> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, change: &StatusChange) {
        if let Some(sender) = self.channels.get(&change.professional_id) {
            let _ = sender.send(change.clone());
        }
        let _ = self.all.send(change.clone());
    }

    pub fn remove(&self, professional_id: &Ulid) {
        self.channels.remove(professional_id);
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn availability_changed(&self, change: StatusChange) {
        self.send(&change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(pid: Ulid, status: AvailabilityStatus) -> StatusChange {
        StatusChange {
            professional_id: pid,
            status,
            timestamp: 1_000,
            next_change_at: Some(2_000),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);
        let mut all = hub.subscribe_all();

        let c = change(pid, AvailabilityStatus::Busy);
        hub.availability_changed(c.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), c);
        assert_eq!(all.recv().await.unwrap(), c);
    }

    #[tokio::test]
    async fn other_professionals_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(&change(Ulid::new(), AvailabilityStatus::Offline));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_channel_closes_subscribers() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);
        hub.remove(&pid);
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&change(Ulid::new(), AvailabilityStatus::Available));
    }

    #[test]
    fn json_payload_shape() {
        let pid = Ulid::new();
        let v: serde_json::Value =
            serde_json::from_str(&change(pid, AvailabilityStatus::Busy).to_json()).unwrap();
        assert_eq!(v["professionalId"], pid.to_string());
        assert_eq!(v["status"], "busy");
        assert_eq!(v["nextChangeAt"], 2_000);
    }
}
