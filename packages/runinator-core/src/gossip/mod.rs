//! UDP gossip discovery.
//!
//! Every process announces its presence as a JSON datagram to a configured
//! list of peers and absorbs the announcements it hears into a process-local
//! [`ServiceDirectory`]. Consumers ask the directory for "the current URL of
//! kind X" and get the freshest non-expired announcement; selection changes
//! are pushed on a watch channel so clients re-target without polling.
//!
//! ```text
//! announce task ──every ANNOUNCE_INTERVAL──► UDP targets
//! receive task ◄──datagrams──────────────── peers
//!     │
//!     └─► ServiceDirectory (mutex map, TTL-pruned on read)
//!             └─► watch::Receiver<Option<base_url>> per service kind
//! ```
//!
//! Unparseable datagrams are dropped without comment. A failed socket bind
//! disables gossip for the process; the caller logs it and carries on with
//! whatever fixed endpoints it was given.

mod directory;
mod node;

pub use directory::ServiceDirectory;
pub use node::{
    GossipConfig, GossipNode, ANNOUNCE_INTERVAL, ANNOUNCE_TTL_SECS, DEFAULT_GOSSIP_PORT,
};

use serde::{Deserialize, Serialize};

use crate::model::ServiceAnnouncement;

/// Which service an announcement is for; the `type` tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    WebService,
    Broker,
    Scheduler,
    Worker,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::WebService => "web_service",
            ServiceKind::Broker => "broker",
            ServiceKind::Scheduler => "scheduler",
            ServiceKind::Worker => "worker",
        }
    }
}

/// The on-the-wire shape of one announcement datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipDatagram {
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub service: ServiceAnnouncement,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_datagram_wire_shape() {
        let datagram = GossipDatagram {
            kind: ServiceKind::WebService,
            service: ServiceAnnouncement {
                service_id: "abc".into(),
                address: "127.0.0.1".into(),
                port: 8080,
                base_path: "/".into(),
                last_heartbeat: Utc::now(),
            },
        };
        let json = serde_json::to_value(&datagram).unwrap();
        assert_eq!(json["type"], "web_service");
        assert_eq!(json["service"]["port"], 8080);
    }

    #[test]
    fn test_datagram_tolerates_missing_optional_fields() {
        let json = r#"{"type":"broker","service":{"port":5000,"last_heartbeat":"2025-01-16T12:00:00Z"}}"#;
        let datagram: GossipDatagram = serde_json::from_str(json).unwrap();
        assert_eq!(datagram.kind, ServiceKind::Broker);
        assert!(datagram.service.address.is_empty());
        assert!(datagram.service.service_id.is_empty());
    }
}
