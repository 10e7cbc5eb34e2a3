//! Data model shared across the services.
//!
//! `ScheduledTask` and `TaskRun` are the persistent rows owned by the web
//! service; `Firing` is the transient unit the broker manages;
//! `ServiceAnnouncement` is the soft state gossip spreads around.
//!
//! Opaque handler payloads (`action_configuration`) are raw bytes in memory
//! and base64 strings on every JSON boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named task with a cron schedule and an opaque handler payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub cron_schedule: String,
    pub action_name: String,
    pub action_function: String,
    #[serde(with = "base64_bytes")]
    pub action_configuration: Vec<u8>,
    pub timeout_ms: i64,
    pub next_execution: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// Fields for creating a task; the web service assigns the id and the
/// initial `next_execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScheduledTask {
    pub name: String,
    pub cron_schedule: String,
    pub action_name: String,
    pub action_function: String,
    #[serde(with = "base64_bytes")]
    pub action_configuration: Vec<u8>,
    pub timeout_ms: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update for `PATCH /tasks/{id}`; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_function: Option<String>,
    #[serde(default, with = "optional_base64_bytes", skip_serializing_if = "Option::is_none")]
    pub action_configuration: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// One recorded invocation of a task. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// A run record as reported by a worker, before the id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTaskRun {
    pub task_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
}

/// A firing to publish: one scheduled occurrence of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFiring {
    pub task_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub attempt: u32,
    pub action_name: String,
    pub action_function: String,
    #[serde(with = "base64_bytes")]
    pub configuration: Vec<u8>,
    pub timeout_ms: i64,
}

impl NewFiring {
    /// Build attempt-zero firing data from a task and a slot.
    pub fn for_task(task: &ScheduledTask, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            scheduled_for,
            attempt: 0,
            action_name: task.action_name.clone(),
            action_function: task.action_function.clone(),
            configuration: task.action_configuration.clone(),
            timeout_ms: task.timeout_ms,
        }
    }
}

/// A firing as tracked by the broker and handed to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Firing {
    pub firing_id: u64,
    pub task_id: i64,
    pub scheduled_for: DateTime<Utc>,
    pub attempt: u32,
    pub action_name: String,
    pub action_function: String,
    #[serde(with = "base64_bytes")]
    pub configuration: Vec<u8>,
    pub timeout_ms: i64,
}

/// A firing that exhausted its attempts or was dropped explicitly.
/// Retained for observation, never re-leased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadFiring {
    pub firing: Firing,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// One service's presence as carried in gossip datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnnouncement {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub base_path: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceAnnouncement {
    /// The HTTP base URL this announcement advertises, always with a
    /// trailing slash: `http://address:port/base_path/`.
    pub fn base_url(&self) -> String {
        let path = self.base_path.trim_matches('/');
        if path.is_empty() {
            format!("http://{}:{}/", self.address, self.port)
        } else {
            format!("http://{}:{}/{}/", self.address, self.port, path)
        }
    }
}

/// Base64 (standard alphabet) codec for opaque byte payloads in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod optional_base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        match s {
            Some(s) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_task() -> ScheduledTask {
        ScheduledTask {
            id: 7,
            name: "nightly-report".to_string(),
            cron_schedule: "0 3 * * *".to_string(),
            action_name: "Console".to_string(),
            action_function: "run_console".to_string(),
            action_configuration: b"echo hi".to_vec(),
            timeout_ms: 30_000,
            next_execution: Some(Utc.with_ymd_and_hms(2025, 1, 17, 3, 0, 0).unwrap()),
            enabled: true,
        }
    }

    #[test]
    fn test_task_json_round_trip() {
        let task = sample_task();
        let json = serde_json::to_string(&task).unwrap();
        let back: ScheduledTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_configuration_is_base64_on_the_wire() {
        let json = serde_json::to_value(sample_task()).unwrap();
        assert_eq!(json["action_configuration"], "ZWNobyBoaQ==");
    }

    #[test]
    fn test_datetime_serializes_as_utc_iso8601() {
        let json = serde_json::to_value(sample_task()).unwrap();
        let text = json["next_execution"].as_str().unwrap();
        assert!(text.starts_with("2025-01-17T03:00:00"));
        assert!(text.ends_with('Z') || text.contains("+00:00"));
    }

    #[test]
    fn test_patch_omits_absent_fields() {
        let patch = TaskPatch {
            enabled: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "enabled": false }));
    }

    #[test]
    fn test_base_url_forms() {
        let mut ann = ServiceAnnouncement {
            service_id: "a".into(),
            address: "127.0.0.1".into(),
            port: 8080,
            base_path: String::new(),
            last_heartbeat: Utc::now(),
        };
        assert_eq!(ann.base_url(), "http://127.0.0.1:8080/");
        ann.base_path = "/".into();
        assert_eq!(ann.base_url(), "http://127.0.0.1:8080/");
        ann.base_path = "api".into();
        assert_eq!(ann.base_url(), "http://127.0.0.1:8080/api/");
    }
}
