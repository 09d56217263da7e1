//! IPC wire types and coordinator configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity of one cooperating process
pub type ClusterId = u32;

/// Request published to a sibling's channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcEnvelope {
    pub command: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub source_cluster: ClusterId,
    /// Where the receiver publishes its answer; absent for fire-and-forget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_channel: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl IpcEnvelope {
    pub fn request(
        command: &str,
        data: serde_json::Value,
        source_cluster: ClusterId,
        response_channel: Option<String>,
    ) -> Self {
        Self {
            command: command.to_string(),
            data,
            source_cluster,
            response_channel,
            timestamp: Utc::now(),
        }
    }
}

/// Answer published to a request's response channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl IpcResponse {
    pub fn new(cluster_id: ClusterId, data: serde_json::Value) -> Self {
        Self {
            cluster_id,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Runtime coordinator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    pub cluster_id: ClusterId,
    /// Cluster ids are `0..cluster_count`
    pub cluster_count: u32,
    pub channel_prefix: String,
    /// Default wait for sibling responses
    pub broadcast_deadline: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cluster_id: 0,
            cluster_count: 1,
            channel_prefix: "cluster_".to_string(),
            broadcast_deadline: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(60),
        }
    }
}

impl CoordinatorConfig {
    /// Channel a cluster listens on for requests
    pub fn channel_for(&self, cluster_id: ClusterId) -> String {
        format!("{}{}", self.channel_prefix, cluster_id)
    }

    /// Key holding a cluster's last heartbeat
    pub fn heartbeat_key(&self, cluster_id: ClusterId) -> String {
        format!("{}{}_heartbeat", self.channel_prefix, cluster_id)
    }

    /// Every cluster except this one
    pub fn siblings(&self) -> impl Iterator<Item = ClusterId> + '_ {
        (0..self.cluster_count).filter(move |id| *id != self.cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = IpcEnvelope::request(
            "get_guild",
            json!({"guild_id": 1}),
            2,
            Some("response_get_guild_2_1_0".to_string()),
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["command"], "get_guild");
        assert_eq!(value["data"]["guild_id"], 1);
        assert_eq!(value["source_cluster"], 2);
        assert_eq!(value["response_channel"], "response_get_guild_2_1_0");
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_envelope_without_response_channel() {
        let raw = r#"{"command":"ping","data":{},"source_cluster":1,"timestamp":"2024-05-01T12:00:00Z"}"#;
        let envelope: IpcEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.response_channel, None);

        let encoded = serde_json::to_string(&envelope).unwrap();
        assert!(!encoded.contains("response_channel"));
    }

    #[test]
    fn test_channel_naming() {
        let config = CoordinatorConfig {
            cluster_id: 1,
            cluster_count: 3,
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.channel_for(2), "cluster_2");
        assert_eq!(config.heartbeat_key(1), "cluster_1_heartbeat");
        assert_eq!(config.siblings().collect::<Vec<_>>(), vec![0, 2]);
    }
}
