//! Registry of live server-side sessions
//!
//! Sessions can be looked up by id, grouped under arbitrary names, and sent
//! one-way invocations in bulk.

use crate::session::Session;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use nexnet_proto::MethodId;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    groups: Arc<DashMap<String, HashSet<Uuid>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session; replaces any entry with the same id
    pub fn register(&self, session: Arc<Session>) {
        let id = session.id();
        info!(session_id = %id, peer = %session.peer(), "Registered session");
        self.sessions.insert(id, session);
    }

    /// Forget a session and drop it from every group
    pub fn unregister(&self, id: Uuid) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);

        self.groups.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });

        if removed.is_some() {
            info!(session_id = %id, "Unregistered session");
        } else {
            debug!(session_id = %id, "Unregister for unknown session");
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Add a registered session to a group; false if the session is unknown
    pub fn add_to_group(&self, group: &str, id: Uuid) -> bool {
        let mut members = self.groups.entry(group.to_string()).or_default();
        // Checked under the group lock; unregister drops the session before pruning groups
        let known = self.sessions.contains_key(&id);
        if known {
            members.insert(id);
        }
        drop(members);

        if !known {
            self.groups.remove_if(group, |_, members| members.is_empty());
            warn!(session_id = %id, group, "Cannot group unknown session");
        }
        known
    }

    pub fn remove_from_group(&self, group: &str, id: Uuid) -> bool {
        let removed = match self.groups.get_mut(group) {
            Some(mut members) => members.remove(&id),
            None => false,
        };
        self.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }

    pub fn group_members(&self, group: &str) -> Vec<Uuid> {
        self.groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// One-way invocation on every session except `except`
    ///
    /// Returns how many sessions accepted the request.
    pub async fn broadcast(
        &self,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
        except: Option<Uuid>,
    ) -> usize {
        let targets: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| Some(*entry.key()) != except)
            .map(|entry| entry.value().clone())
            .collect();
        Self::fan_out(targets, method_id, arguments.into()).await
    }

    /// One-way invocation on every member of `group`
    pub async fn broadcast_group(
        &self,
        group: &str,
        method_id: MethodId,
        arguments: impl Into<Bytes>,
    ) -> usize {
        let targets: Vec<Arc<Session>> = self
            .group_members(group)
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect();
        Self::fan_out(targets, method_id, arguments.into()).await
    }

    async fn fan_out(targets: Vec<Arc<Session>>, method_id: MethodId, arguments: Bytes) -> usize {
        let sends = targets.iter().map(|session| {
            let arguments = arguments.clone();
            async move {
                match session.invoke_oneway(method_id, arguments, &[]).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(session_id = %session.id(), method_id, "Broadcast send failed: {}", e);
                        false
                    }
                }
            }
        });

        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        debug!(method_id, targets = targets.len(), delivered, "Broadcast complete");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::dispatch::{handler_fn, MethodTable};
    use nexnet_transport::memory_pair;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const NOTIFY: MethodId = 9;

    /// Server-side session registered in `registry`, plus a receiver of every
    /// NOTIFY payload the client side gets
    async fn connected(
        registry: &ConnectionRegistry,
        label: &'static str,
        seen: mpsc::UnboundedSender<(&'static str, Bytes)>,
    ) -> (Arc<Session>, Arc<Session>) {
        let (a, b) = memory_pair(64 * 1024);
        let client_methods = MethodTable::new(3).with_handler(
            NOTIFY,
            handler_fn(move |ctx| {
                let seen = seen.clone();
                async move {
                    let _ = seen.send((label, ctx.arguments().clone()));
                    Ok(None)
                }
            }),
        );

        let accept = tokio::spawn(async move {
            Session::accept(
                Box::new(b),
                SessionConfig::default(),
                Arc::new(MethodTable::new(3)),
                None,
            )
            .await
        });
        let client = Session::connect(Box::new(a), SessionConfig::default(), Arc::new(client_methods))
            .await
            .unwrap();
        let server = accept.await.unwrap().unwrap();
        registry.register(server.clone());
        (server, client)
    }

    async fn drain(
        rx: &mut mpsc::UnboundedReceiver<(&'static str, Bytes)>,
        expected: usize,
    ) -> Vec<&'static str> {
        let mut labels = Vec::new();
        for _ in 0..expected {
            let (label, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(payload, Bytes::from_static(b"hello"));
            labels.push(label);
        }
        labels.sort();
        labels
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_session() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (first, _c1) = connected(&registry, "first", tx.clone()).await;
        let (_second, _c2) = connected(&registry, "second", tx.clone()).await;
        let (_third, _c3) = connected(&registry, "third", tx).await;
        assert_eq!(registry.count(), 3);

        let delivered = registry
            .broadcast(NOTIFY, Bytes::from_static(b"hello"), Some(first.id()))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut rx, 2).await, vec!["second", "third"]);
    }

    #[tokio::test]
    async fn test_group_membership_and_broadcast() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (first, _c1) = connected(&registry, "first", tx.clone()).await;
        let (second, _c2) = connected(&registry, "second", tx).await;

        assert!(registry.add_to_group("ops", first.id()));
        assert!(registry.add_to_group("ops", second.id()));
        assert!(!registry.add_to_group("ops", Uuid::new_v4()));
        assert_eq!(registry.group_members("ops").len(), 2);

        assert!(registry.remove_from_group("ops", second.id()));
        assert!(!registry.remove_from_group("ops", second.id()));

        let delivered = registry
            .broadcast_group("ops", NOTIFY, Bytes::from_static(b"hello"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut rx, 1).await, vec!["first"]);
    }

    #[tokio::test]
    async fn test_unregister_prunes_groups() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, _client) = connected(&registry, "only", tx).await;

        registry.add_to_group("a", session.id());
        registry.add_to_group("b", session.id());

        assert!(registry.unregister(session.id()).is_some());
        assert!(registry.unregister(session.id()).is_none());
        assert!(registry.group_members("a").is_empty());
        assert!(registry.group_members("b").is_empty());
        assert_eq!(registry.count(), 0);
        assert_eq!(
            registry
                .broadcast_group("a", NOTIFY, Bytes::from_static(b"hello"))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_grouping_racing_unregister_leaves_no_member() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (session, _client) = connected(&registry, "racer", tx).await;
        let id = session.id();

        assert!(registry.unregister(id).is_some());
        assert!(!registry.add_to_group("late", id));
        assert!(!registry.groups.contains_key("late"));

        for _ in 0..200 {
            registry.register(session.clone());
            let grouping = registry.clone();
            std::thread::scope(|scope| {
                let adder = scope.spawn(move || grouping.add_to_group("race", id));
                registry.unregister(id);
                adder.join().unwrap();
            });
            assert!(registry.group_members("race").is_empty());
            assert!(!registry.groups.contains_key("race"));
        }
    }
}
