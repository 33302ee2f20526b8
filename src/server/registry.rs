//! Connection registry
//!
//! Process-wide view of live connections: device identities with activity
//! timestamps plus an append-only session log. The registry holds no
//! ownership over connections; closing a connection is what frees its
//! providers, the registry only forgets the device entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    pub client_id: String,
    pub mac_address: Option<String>,
    pub device_model: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub messages: Vec<SessionMessage>,
}

pub struct ConnectionRegistry {
    devices: RwLock<HashMap<String, DeviceEntry>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub async fn add_device(&self, client_id: &str) {
        let now = Utc::now();
        let mut devices = self.devices.write().await;
        devices.insert(
            client_id.to_string(),
            DeviceEntry {
                client_id: client_id.to_string(),
                mac_address: None,
                device_model: None,
                connected_at: now,
                last_activity: now,
            },
        );
        info!("Device connected: {}, total: {}", client_id, devices.len());
    }

    /// Fill in client-supplied device details from a `config` message.
    pub async fn update_device_info(
        &self,
        client_id: &str,
        mac_address: Option<String>,
        device_model: Option<String>,
    ) {
        let mut devices = self.devices.write().await;
        if let Some(entry) = devices.get_mut(client_id) {
            if mac_address.is_some() {
                entry.mac_address = mac_address;
            }
            if device_model.is_some() {
                entry.device_model = device_model;
            }
        }
    }

    pub async fn touch(&self, client_id: &str) {
        let mut devices = self.devices.write().await;
        if let Some(entry) = devices.get_mut(client_id) {
            entry.last_activity = Utc::now();
        }
    }

    pub async fn remove_device(&self, client_id: &str) {
        let mut devices = self.devices.write().await;
        if devices.remove(client_id).is_some() {
            info!(
                "Device disconnected: {}, remaining: {}",
                client_id,
                devices.len()
            );
        }
    }

    pub async fn devices(&self) -> Vec<DeviceEntry> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Record a new session. Sessions are append-only; they outlive the
    /// connection for the inventory endpoint.
    pub async fn create_session(&self, session_id: &str, device_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session_id: session_id.to_string(),
                device_id: device_id.to_string(),
                started_at: Utc::now(),
                messages: Vec::new(),
            },
        );
    }

    pub async fn append_message(&self, session_id: &str, role: &str, content: &str) {
        let role = match role {
            "user" | "assistant" | "system" => role,
            _ => "user",
        };
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.messages.push(SessionMessage {
                role: role.to_string(),
                content: content.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.read().await.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_device_lifecycle() {
        let registry = ConnectionRegistry::new();
        registry.add_device("c-1").await;
        registry
            .update_device_info("c-1", Some("aa:bb".to_string()), None)
            .await;
        assert_eq!(registry.device_count().await, 1);

        let devices = registry.devices().await;
        assert_eq!(devices[0].mac_address.as_deref(), Some("aa:bb"));
        assert!(devices[0].device_model.is_none());

        registry.remove_device("c-1").await;
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_sessions_survive_device_removal() {
        let registry = ConnectionRegistry::new();
        registry.add_device("c-1").await;
        registry.create_session("s-1", "dev-1").await;
        registry.append_message("s-1", "user", "你好").await;
        registry.append_message("s-1", "robot", "??").await;
        registry.remove_device("c-1").await;

        let session = registry.session("s-1").await.unwrap();
        assert_eq!(session.device_id, "dev-1");
        assert_eq!(session.messages.len(), 2);
        // unknown roles are coerced to user
        assert_eq!(session.messages[1].role, "user");
    }
}
