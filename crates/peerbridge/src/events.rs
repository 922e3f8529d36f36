//! Event subscription tables.
//!
//! Two kinds of events flow through the same machinery:
//!
//! - **Application events** on an endpoint: a string name and string
//!   arguments, delivered from the peer (`Endpoint::on`).
//! - **Lifecycle events** on a manager: sessions starting, stopping, or
//!   failing ([`LifecycleEvent`]).
//!
//! Handlers are cloned out of the table before they run, so a handler may
//! subscribe further handlers or emit events without deadlocking.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::Endpoint;
use crate::lock;

/// A registered event handler.
pub(crate) type Handler<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// Handlers keyed by event, called in subscription order.
pub(crate) struct Subscribers<K, A: ?Sized> {
    table: Mutex<HashMap<K, Vec<Handler<A>>>>,
}

impl<K: Eq + Hash, A: ?Sized> Subscribers<K, A> {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe(&self, key: K, handler: Handler<A>) {
        lock(&self.table).entry(key).or_default().push(handler);
    }

    /// Calls every handler for `key`. Returns how many ran.
    pub(crate) fn emit<Q>(&self, key: &Q, arg: &A) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let handlers = match lock(&self.table).get(key) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };
        for handler in &handlers {
            handler(arg);
        }
        handlers.len()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// Session lifecycle events published by managers.
///
/// `Session*` events come from a [`ServerManager`](crate::ServerManager) or
/// [`ClientManager`](crate::ClientManager); a
/// [`PeerManager`](crate::PeerManager) republishes both as `Peer*`.
#[derive(Clone)]
pub enum LifecycleEvent {
    /// A session was established on the endpoint.
    SessionStarted(Endpoint),
    /// An established session ended.
    SessionStopped(Endpoint),
    /// The session failed (rejected, timed out, violated, disconnected).
    SessionError(Endpoint, String),
    PeerStarted(Endpoint),
    PeerStopped(Endpoint),
    PeerError(Endpoint, String),
}

/// The key handlers subscribe under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    SessionStarted,
    SessionStopped,
    SessionError,
    PeerStarted,
    PeerStopped,
    PeerError,
}

impl LifecycleEvent {
    pub fn kind(&self) -> LifecycleKind {
        match self {
            Self::SessionStarted(_) => LifecycleKind::SessionStarted,
            Self::SessionStopped(_) => LifecycleKind::SessionStopped,
            Self::SessionError(..) => LifecycleKind::SessionError,
            Self::PeerStarted(_) => LifecycleKind::PeerStarted,
            Self::PeerStopped(_) => LifecycleKind::PeerStopped,
            Self::PeerError(..) => LifecycleKind::PeerError,
        }
    }

    /// The endpoint the event is about.
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::SessionStarted(ep)
            | Self::SessionStopped(ep)
            | Self::SessionError(ep, _)
            | Self::PeerStarted(ep)
            | Self::PeerStopped(ep)
            | Self::PeerError(ep, _) => ep,
        }
    }

    /// The failure reason, for error events.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::SessionError(_, reason) | Self::PeerError(_, reason) => Some(reason),
            _ => None,
        }
    }

    /// The `Peer*` counterpart of a `Session*` event.
    pub(crate) fn into_peer(self) -> Self {
        match self {
            Self::SessionStarted(ep) => Self::PeerStarted(ep),
            Self::SessionStopped(ep) => Self::PeerStopped(ep),
            Self::SessionError(ep, reason) => Self::PeerError(ep, reason),
            peer => peer,
        }
    }
}

impl fmt::Debug for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("LifecycleEvent");
        d.field("kind", &self.kind());
        d.field("endpoint", &self.endpoint().id());
        if let Some(reason) = self.reason() {
            d.field("reason", &reason);
        }
        d.finish()
    }
}

/// A manager's lifecycle subscribers.
pub(crate) struct LifecycleBus {
    subscribers: Subscribers<LifecycleKind, LifecycleEvent>,
}

impl LifecycleBus {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Subscribers::new(),
        }
    }

    pub(crate) fn on<F>(&self, kind: LifecycleKind, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(kind, Arc::new(handler));
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle event");
        self.subscribers.emit(&event.kind(), &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_calls_handlers_for_key_only() {
        let subs: Subscribers<String, [String]> = Subscribers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        subs.subscribe(
            "SHARE_BOARD".to_string(),
            Arc::new(move |args: &[String]| {
                assert_eq!(args, ["host:1:b".to_string()]);
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(subs.emit("SHARE_BOARD", &["host:1:b".to_string()][..]), 1);
        assert_eq!(subs.emit("UNSHARE_BOARD", &[][..]), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_runs_multiple_handlers_in_order() {
        let subs: Subscribers<&'static str, Mutex<Vec<u32>>> = Subscribers::new();
        subs.subscribe("e", Arc::new(|v: &Mutex<Vec<u32>>| lock(v).push(1)));
        subs.subscribe("e", Arc::new(|v: &Mutex<Vec<u32>>| lock(v).push(2)));

        let seen = Mutex::new(Vec::new());
        assert_eq!(subs.emit("e", &seen), 2);
        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[test]
    fn test_handler_may_subscribe_while_emitting() {
        let subs: Arc<Subscribers<u8, ()>> = Arc::new(Subscribers::new());
        let inner = Arc::clone(&subs);
        subs.subscribe(
            0,
            Arc::new(move |_: &()| inner.subscribe(1, Arc::new(|_: &()| {}))),
        );

        subs.emit(&0, &());
        assert_eq!(subs.emit(&1, &()), 1);
    }
}
