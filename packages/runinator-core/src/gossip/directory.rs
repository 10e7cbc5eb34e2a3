//! The process-local directory of service announcements.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use tokio::sync::watch;

use super::ServiceKind;
use crate::model::ServiceAnnouncement;

/// Soft-state map of who is out there, keyed by service kind and id.
///
/// Entries age by their `last_heartbeat` timestamp and are pruned lazily on
/// every read; nothing holds references across threads. For each kind a
/// watch channel carries the currently selected base URL (freshest
/// heartbeat wins) so consumers learn about failovers as they happen.
pub struct ServiceDirectory {
    ttl: Duration,
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    entries: HashMap<ServiceKind, HashMap<String, ServiceAnnouncement>>,
    selections: HashMap<ServiceKind, watch::Sender<Option<String>>>,
}

impl ServiceDirectory {
    /// Create a directory whose entries expire `ttl` after their heartbeat.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(State::default()),
        }
    }

    /// Upsert an announcement, keyed by its `service_id`.
    pub fn observe(&self, kind: ServiceKind, announcement: ServiceAnnouncement) {
        let mut state = self.inner.lock().unwrap();
        state
            .entries
            .entry(kind)
            .or_default()
            .insert(announcement.service_id.clone(), announcement);
        Self::refresh_selection(&mut state, kind, self.ttl);
    }

    /// The freshest live announcement of the given kind, if any.
    pub fn current(&self, kind: ServiceKind) -> Option<ServiceAnnouncement> {
        let mut state = self.inner.lock().unwrap();
        Self::refresh_selection(&mut state, kind, self.ttl)
    }

    /// All live announcements of the given kind.
    pub fn entries(&self, kind: ServiceKind) -> Vec<ServiceAnnouncement> {
        let mut state = self.inner.lock().unwrap();
        Self::prune(&mut state, kind, self.ttl);
        state
            .entries
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscribe to the selected base URL for a kind.
    ///
    /// The receiver starts at the current selection and is updated whenever
    /// the freshest announcement changes or expires.
    pub fn subscribe(&self, kind: ServiceKind) -> watch::Receiver<Option<String>> {
        let mut state = self.inner.lock().unwrap();
        let current = Self::refresh_selection(&mut state, kind, self.ttl);
        state
            .selections
            .entry(kind)
            .or_insert_with(|| watch::channel(current.map(|a| a.base_url())).0)
            .subscribe()
    }

    fn prune(state: &mut State, kind: ServiceKind, ttl: Duration) {
        let deadline = Utc::now() - ttl;
        if let Some(entries) = state.entries.get_mut(&kind) {
            entries.retain(|_, a| a.last_heartbeat > deadline);
        }
    }

    /// Prune, pick the freshest announcement, and push the selection to any
    /// watchers when it changed.
    fn refresh_selection(
        state: &mut State,
        kind: ServiceKind,
        ttl: Duration,
    ) -> Option<ServiceAnnouncement> {
        Self::prune(state, kind, ttl);
        let selected = state
            .entries
            .get(&kind)
            .and_then(|m| m.values().max_by_key(|a| a.last_heartbeat))
            .cloned();
        if let Some(tx) = state.selections.get(&kind) {
            let url = selected.as_ref().map(|a| a.base_url());
            tx.send_if_modified(|slot| {
                if *slot != url {
                    *slot = url.clone();
                    true
                } else {
                    false
                }
            });
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(id: &str, age_secs: i64) -> ServiceAnnouncement {
        ServiceAnnouncement {
            service_id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 8080,
            base_path: String::new(),
            last_heartbeat: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[test]
    fn test_freshest_announcement_wins() {
        let directory = ServiceDirectory::new(Duration::seconds(10));
        directory.observe(ServiceKind::WebService, announcement("old", 5));
        directory.observe(ServiceKind::WebService, announcement("new", 1));

        let selected = directory.current(ServiceKind::WebService).unwrap();
        assert_eq!(selected.service_id, "new");
    }

    #[test]
    fn test_expired_entries_are_pruned_on_read() {
        let directory = ServiceDirectory::new(Duration::seconds(10));
        directory.observe(ServiceKind::WebService, announcement("stale", 30));
        assert!(directory.current(ServiceKind::WebService).is_none());
        assert!(directory.entries(ServiceKind::WebService).is_empty());
    }

    #[test]
    fn test_selection_switches_when_winner_expires() {
        let directory = ServiceDirectory::new(Duration::seconds(10));
        directory.observe(ServiceKind::WebService, announcement("steady", 8));
        directory.observe(ServiceKind::WebService, announcement("winner", 0));
        assert_eq!(
            directory.current(ServiceKind::WebService).unwrap().service_id,
            "winner"
        );

        // The winner stops announcing: fast-forward it past the TTL by
        // re-observing the steady node with a fresh heartbeat only.
        let mut winner = announcement("winner", 20);
        winner.last_heartbeat = Utc::now() - Duration::seconds(20);
        directory.observe(ServiceKind::WebService, winner);
        directory.observe(ServiceKind::WebService, announcement("steady", 0));
        assert_eq!(
            directory.current(ServiceKind::WebService).unwrap().service_id,
            "steady"
        );
    }

    #[test]
    fn test_upsert_overwrites_heartbeat_by_service_id() {
        let directory = ServiceDirectory::new(Duration::seconds(10));
        directory.observe(ServiceKind::Broker, announcement("a", 9));
        directory.observe(ServiceKind::Broker, announcement("a", 0));
        assert_eq!(directory.entries(ServiceKind::Broker).len(), 1);
    }

    #[test]
    fn test_watchers_learn_about_selection_changes() {
        let directory = ServiceDirectory::new(Duration::seconds(10));
        let mut rx = directory.subscribe(ServiceKind::WebService);
        assert!(rx.borrow().is_none());

        directory.observe(ServiceKind::WebService, announcement("a", 0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().as_deref(),
            Some("http://127.0.0.1:8080/")
        );
    }

    #[test]
    fn test_kinds_do_not_mix() {
        let directory = ServiceDirectory::new(Duration::seconds(10));
        directory.observe(ServiceKind::Broker, announcement("b", 0));
        assert!(directory.current(ServiceKind::WebService).is_none());
        assert!(directory.current(ServiceKind::Broker).is_some());
    }
}
