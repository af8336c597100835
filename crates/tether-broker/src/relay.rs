//! Signaling relay
//!
//! Routes events between sessions. Point-to-point events are resolved through
//! the [`PresenceRegistry`] and delivered to exactly one session; room events
//! go to every other member of the room.
//!
//! Delivery is fire-and-forget. Rate-limited events and events for keys with
//! no live session are dropped without telling the sender; both are logged
//! and counted in [`RelayStats`].
//!
//! The relay keeps no call state. Call lifecycle events (`call-accepted`,
//! `call-rejected`, `call-ended`) are forwarded every time they arrive, in
//! whatever order, with no deduplication.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::normalize_identity_key;

use crate::messages::{ClientEvent, RoomMessage, Route, ServerEvent};
use crate::presence::PresenceRegistry;
use crate::rate_limiter::RateLimiter;
use crate::room::Rooms;
use crate::session::{Session, SessionId, Sessions};

/// What happened to an inbound event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Identity key bound to the session
    Registered,
    /// Session added to a room
    Joined,
    /// Event queued for this many sessions
    Delivered(usize),
    /// Origin over its rate budget
    RateLimited,
    /// Destination key has no live session
    RoutingMiss,
    /// Empty key or room name
    Ignored,
}

/// Relay counters
#[derive(Default)]
pub struct RelayStats {
    delivered: AtomicU64,
    routing_misses: AtomicU64,
    rate_limited: AtomicU64,
    broadcasts: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub delivered: u64,
    pub routing_misses: u64,
    pub rate_limited: u64,
    pub broadcasts: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            routing_misses: self.routing_misses.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
        }
    }
}

/// Session-to-session event router
#[derive(Clone)]
pub struct SignalingRelay {
    registry: Arc<PresenceRegistry>,
    limiter: RateLimiter,
    sessions: Arc<Sessions>,
    rooms: Arc<Rooms>,
    stats: Arc<RelayStats>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<PresenceRegistry>, limiter: RateLimiter) -> Self {
        Self {
            registry,
            limiter,
            sessions: Arc::new(Sessions::new()),
            rooms: Arc::new(Rooms::new()),
            stats: Arc::new(RelayStats::default()),
        }
    }

    /// Transport connect: open an outbound queue for a new session
    pub fn connect(
        &self,
        id: SessionId,
        origin: impl Into<String>,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.open(id.clone(), tx);
        let session = Session::new(id, origin);
        debug!("Session {} connected from {}", session.id, session.origin);
        (session, rx)
    }

    /// Transport disconnect: release the session's binding and rooms
    pub fn disconnect(&self, session: Session) {
        if let Some(binding) = &session.binding {
            self.registry.release(binding);
        }
        for room in &session.rooms {
            self.rooms.leave(room, &session.id);
        }
        self.sessions.close(&session.id);
        debug!("Session {} disconnected", session.id);
    }

    /// Handle one inbound event from `session`
    pub fn handle(&self, session: &mut Session, event: ClientEvent) -> Outcome {
        if event.is_rate_limited() && !self.limiter.admit(&session.origin) {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dropped {} from {} (rate limited)",
                event.kind(),
                session.origin
            );
            return Outcome::RateLimited;
        }

        match event {
            ClientEvent::Register(key) => self.register(session, &key),

            ClientEvent::RequestConnection(route) => self.forward(&route, |from| {
                ServerEvent::IncomingRequest { from }
            }),

            ClientEvent::AcceptConnection(route) => self.forward(&route, |from| {
                ServerEvent::ConnectionAccepted { from }
            }),

            ClientEvent::CallRequest(req) => {
                let route = Route {
                    to: req.to,
                    from: req.from,
                };
                let call_type = req.call_type;
                self.forward(&route, move |from| ServerEvent::IncomingCall { from, call_type })
            }

            ClientEvent::CallAccepted(route) => {
                self.forward(&route, |from| ServerEvent::CallAccepted { from })
            }

            ClientEvent::CallRejected(route) => {
                self.forward(&route, |from| ServerEvent::CallRejected { from })
            }

            ClientEvent::CallEnded(route) => {
                self.forward(&route, |from| ServerEvent::CallEnded { from })
            }

            ClientEvent::Join(room) => self.join(session, &room),

            ClientEvent::Signal(RoomMessage { room, payload }) => {
                self.broadcast(session, &room, ServerEvent::Signal(payload))
            }

            ClientEvent::Auth(RoomMessage { room, payload }) => {
                self.broadcast(session, &room, ServerEvent::Auth(payload))
            }
        }
    }

    fn register(&self, session: &mut Session, key: &str) -> Outcome {
        let normalized = normalize_identity_key(key);
        if normalized.is_empty() {
            debug!("Ignored empty registration from {}", session.id);
            return Outcome::Ignored;
        }

        // Switching keys: give up the old one first
        if let Some(previous) = session.binding.take() {
            if previous.key() != normalized {
                self.registry.release(&previous);
            }
        }

        session.binding = self.registry.register(&normalized, &session.id);
        Outcome::Registered
    }

    fn forward<F>(&self, route: &Route, build: F) -> Outcome
    where
        F: FnOnce(String) -> ServerEvent,
    {
        let to = normalize_identity_key(&route.to);
        let from = normalize_identity_key(&route.from);

        let Some(target) = self.registry.resolve(&to) else {
            self.stats.routing_misses.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped event from {} to {}: recipient not present", from, to);
            return Outcome::RoutingMiss;
        };

        if self.sessions.send(&target, build(from)) {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            Outcome::Delivered(1)
        } else {
            self.stats.routing_misses.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped event to {}: session {} gone", to, target);
            Outcome::RoutingMiss
        }
    }

    fn join(&self, session: &mut Session, room: &str) -> Outcome {
        let room = room.trim();
        if room.is_empty() {
            return Outcome::Ignored;
        }

        self.rooms.join(room, &session.id);
        session.rooms.insert(room.to_string());
        info!("Session {} joined room {}", session.id, room);
        Outcome::Joined
    }

    fn broadcast(&self, session: &Session, room: &str, event: ServerEvent) -> Outcome {
        let room = room.trim();
        if room.is_empty() {
            return Outcome::Ignored;
        }

        let mut delivered = 0;
        for member in self.rooms.recipients(room, &session.id) {
            if self.sessions.send(&member, event.clone()) {
                delivered += 1;
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        debug!(
            "Broadcast from {} to room {} reached {} sessions",
            session.id, room, delivered
        );
        Outcome::Delivered(delivered)
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::CallRequest;
    use serde_json::json;
    use tether_core::RateLimitConfig;

    fn relay() -> SignalingRelay {
        SignalingRelay::new(Arc::new(PresenceRegistry::new()), RateLimiter::new())
    }

    fn route(to: &str, from: &str) -> Route {
        Route {
            to: to.into(),
            from: from.into(),
        }
    }

    fn connect(
        relay: &SignalingRelay,
        id: &str,
    ) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        relay.connect(SessionId::from(id), format!("origin-{}", id))
    }

    #[test]
    fn test_request_connection_delivered_to_target_only() {
        let relay = relay();
        let (mut alice, mut alice_rx) = connect(&relay, "a");
        let (mut bob, mut bob_rx) = connect(&relay, "b");
        let (_carol, mut carol_rx) = connect(&relay, "c");

        relay.handle(&mut alice, ClientEvent::Register("ALICE".into()));
        relay.handle(&mut bob, ClientEvent::Register("BOB".into()));

        let outcome = relay.handle(
            &mut alice,
            ClientEvent::RequestConnection(route("BOB", "ALICE")),
        );
        assert_eq!(outcome, Outcome::Delivered(1));
        assert_eq!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::IncomingRequest {
                from: "ALICE".into()
            }
        );
        assert!(alice_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());

        relay.handle(&mut bob, ClientEvent::AcceptConnection(route("ALICE", "BOB")));
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            ServerEvent::ConnectionAccepted { from: "BOB".into() }
        );
    }

    #[test]
    fn test_call_to_unregistered_key_dropped() {
        let relay = relay();
        let (mut y, mut y_rx) = connect(&relay, "y");
        let (_other, mut other_rx) = connect(&relay, "o");

        let outcome = relay.handle(
            &mut y,
            ClientEvent::CallRequest(CallRequest {
                to: "X".into(),
                from: "Y".into(),
                call_type: "audio".into(),
            }),
        );

        assert_eq!(outcome, Outcome::RoutingMiss);
        assert!(y_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
        assert_eq!(relay.stats().routing_misses, 1);
    }

    #[test]
    fn test_call_lifecycle_forwarded_without_dedup() {
        let relay = relay();
        let (mut caller, mut caller_rx) = connect(&relay, "caller");
        let (mut callee, mut callee_rx) = connect(&relay, "callee");
        relay.handle(&mut caller, ClientEvent::Register("K1".into()));
        relay.handle(&mut callee, ClientEvent::Register("K2".into()));

        relay.handle(
            &mut caller,
            ClientEvent::CallRequest(CallRequest {
                to: "K2".into(),
                from: "K1".into(),
                call_type: "video".into(),
            }),
        );
        assert_eq!(
            callee_rx.try_recv().unwrap(),
            ServerEvent::IncomingCall {
                from: "K1".into(),
                call_type: "video".into()
            }
        );

        // Duplicate acceptances are both forwarded
        relay.handle(&mut callee, ClientEvent::CallAccepted(route("K1", "K2")));
        relay.handle(&mut callee, ClientEvent::CallAccepted(route("K1", "K2")));
        assert_eq!(
            caller_rx.try_recv().unwrap(),
            ServerEvent::CallAccepted { from: "K2".into() }
        );
        assert_eq!(
            caller_rx.try_recv().unwrap(),
            ServerEvent::CallAccepted { from: "K2".into() }
        );

        relay.handle(&mut caller, ClientEvent::CallEnded(route("K2", "K1")));
        assert_eq!(
            callee_rx.try_recv().unwrap(),
            ServerEvent::CallEnded { from: "K1".into() }
        );

        // Out of order: rejection after the call ended
        relay.handle(&mut callee, ClientEvent::CallRejected(route("K1", "K2")));
        assert_eq!(
            caller_rx.try_recv().unwrap(),
            ServerEvent::CallRejected { from: "K2".into() }
        );
    }

    #[test]
    fn test_keys_normalized_for_routing() {
        let relay = relay();
        let (mut a, _a_rx) = connect(&relay, "a");
        let (mut b, mut b_rx) = connect(&relay, "b");

        relay.handle(&mut b, ClientEvent::Register("abc def".into()));
        relay.handle(
            &mut a,
            ClientEvent::RequestConnection(route("abcdef", " x y ")),
        );

        assert_eq!(
            b_rx.try_recv().unwrap(),
            ServerEvent::IncomingRequest { from: "xy".into() }
        );
    }

    #[test]
    fn test_latest_registration_receives() {
        let relay = relay();
        let (mut sender, _rx) = connect(&relay, "sender");
        let (mut first, mut first_rx) = connect(&relay, "first");
        let (mut second, mut second_rx) = connect(&relay, "second");

        relay.handle(&mut first, ClientEvent::Register("K".into()));
        relay.handle(&mut second, ClientEvent::Register("K".into()));
        relay.handle(&mut sender, ClientEvent::CallEnded(route("K", "S")));

        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_ok());
    }

    #[test]
    fn test_superseded_disconnect_keeps_newer_registration() {
        let relay = relay();
        let (mut old, _old_rx) = connect(&relay, "old");
        let (mut new, _new_rx) = connect(&relay, "new");

        relay.handle(&mut old, ClientEvent::Register("K".into()));
        relay.handle(&mut new, ClientEvent::Register("K".into()));
        relay.disconnect(old);

        assert_eq!(relay.registry().resolve("K"), Some(SessionId::from("new")));

        relay.disconnect(new);
        assert_eq!(relay.registry().resolve("K"), None);
        assert_eq!(relay.session_count(), 0);
    }

    #[test]
    fn test_reregister_with_new_key_releases_old() {
        let relay = relay();
        let (mut s, _rx) = connect(&relay, "s");

        relay.handle(&mut s, ClientEvent::Register("K1".into()));
        relay.handle(&mut s, ClientEvent::Register("K2".into()));

        assert_eq!(relay.registry().resolve("K1"), None);
        assert_eq!(relay.registry().resolve("K2"), Some(SessionId::from("s")));
        assert_eq!(s.identity(), Some("K2"));
    }

    #[test]
    fn test_registration_rate_limited() {
        let config = RateLimitConfig {
            max_requests: 2,
            ..RateLimitConfig::default()
        };
        let relay = SignalingRelay::new(
            Arc::new(PresenceRegistry::new()),
            RateLimiter::with_config(&config),
        );
        let (mut s, _rx) = connect(&relay, "s");

        assert_eq!(relay.handle(&mut s, ClientEvent::Register("A".into())), Outcome::Registered);
        assert_eq!(
            relay.handle(&mut s, ClientEvent::RequestConnection(route("A", "A"))),
            Outcome::Delivered(1)
        );
        assert_eq!(
            relay.handle(&mut s, ClientEvent::Register("B".into())),
            Outcome::RateLimited
        );
        assert_eq!(relay.registry().resolve("B"), None);

        // Acceptance and call lifecycle bypass the limiter
        assert_eq!(
            relay.handle(&mut s, ClientEvent::AcceptConnection(route("A", "A"))),
            Outcome::Delivered(1)
        );
        assert_eq!(
            relay.handle(&mut s, ClientEvent::CallEnded(route("A", "A"))),
            Outcome::Delivered(1)
        );
        assert_eq!(relay.stats().rate_limited, 1);
    }

    #[test]
    fn test_room_broadcast_excludes_sender() {
        let relay = relay();
        let (mut s1, mut rx1) = connect(&relay, "s1");
        let (mut s2, mut rx2) = connect(&relay, "s2");
        let (_s3, mut rx3) = connect(&relay, "s3");

        relay.handle(&mut s1, ClientEvent::Join("R".into()));
        relay.handle(&mut s2, ClientEvent::Join("R".into()));

        let payload = json!({"type": "offer", "sdp": "v=0"});
        let outcome = relay.handle(
            &mut s1,
            ClientEvent::Signal(RoomMessage {
                room: "R".into(),
                payload: payload.clone(),
            }),
        );

        assert_eq!(outcome, Outcome::Delivered(1));
        assert_eq!(rx2.try_recv().unwrap(), ServerEvent::Signal(payload));
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err());

        relay.handle(
            &mut s2,
            ClientEvent::Auth(RoomMessage {
                room: "R".into(),
                payload: json!("token"),
            }),
        );
        assert_eq!(rx1.try_recv().unwrap(), ServerEvent::Auth(json!("token")));
    }

    #[test]
    fn test_disconnect_leaves_rooms() {
        let relay = relay();
        let (mut s1, _rx1) = connect(&relay, "s1");
        let (mut s2, mut rx2) = connect(&relay, "s2");

        relay.handle(&mut s1, ClientEvent::Join("R".into()));
        relay.handle(&mut s1, ClientEvent::Join("Q".into()));
        relay.handle(&mut s2, ClientEvent::Join("R".into()));
        assert_eq!(relay.room_count(), 2);

        relay.disconnect(s1);
        assert_eq!(relay.room_count(), 1);

        let (mut s3, _rx3) = connect(&relay, "s3");
        relay.handle(
            &mut s3,
            ClientEvent::Signal(RoomMessage {
                room: "R".into(),
                payload: json!(1),
            }),
        );
        assert_eq!(rx2.try_recv().unwrap(), ServerEvent::Signal(json!(1)));
    }

    #[test]
    fn test_empty_inputs_ignored() {
        let relay = relay();
        let (mut s, _rx) = connect(&relay, "s");

        assert_eq!(relay.handle(&mut s, ClientEvent::Register(" ".into())), Outcome::Ignored);
        assert_eq!(relay.handle(&mut s, ClientEvent::Join("".into())), Outcome::Ignored);
        assert!(relay.registry().is_empty());
        assert_eq!(relay.room_count(), 0);
    }
}
