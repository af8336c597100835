//! Broker server: wiring and background maintenance

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use tether_core::{Clock, Config, SystemClock};

use crate::api::{router, BrokerState};
use crate::directory::{Directory, DirectoryStore};
use crate::presence::PresenceRegistry;
use crate::rate_limiter::RateLimiter;
use crate::relay::SignalingRelay;

/// Broker server state
pub struct BrokerServer {
    state: BrokerState,
    rate_sweep: Duration,
    directory_sweep: Duration,
}

impl BrokerServer {
    /// Build a server from configuration and an opened directory store
    pub fn new(config: &Config, store: Arc<dyn DirectoryStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, store: Arc<dyn DirectoryStore>, clock: Arc<dyn Clock>) -> Self {
        let limiter = RateLimiter::with_clock(&config.rate_limit, clock.clone());
        let relay = SignalingRelay::new(Arc::new(PresenceRegistry::new()), limiter);
        let directory = Directory::new(store, clock, config.directory.temporary_ttl());

        Self {
            state: BrokerState {
                relay,
                directory: Arc::new(directory),
                namespace: Arc::from(config.directory.namespace.as_str()),
                trust_forwarded_for: config.server.trust_forwarded_for,
            },
            rate_sweep: Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
            directory_sweep: Duration::from_secs(config.directory.sweep_interval_secs.max(1)),
        }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn serve(self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Broker listening on {}", listener.local_addr()?);

        self.spawn_maintenance();

        let app = router(self.state).layer(TraceLayer::new_for_http());
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }

    /// Periodic rate-table and directory sweeps
    fn spawn_maintenance(&self) {
        let limiter = self.state.relay.limiter().clone();
        let period = self.rate_sweep;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                limiter.cleanup_expired();
            }
        });

        let directory = self.state.directory.clone();
        let period = self.directory_sweep;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = directory.purge_expired().await {
                    error!("Directory sweep failed: {}", e);
                }
            }
        });
    }

    /// Get session count (for monitoring)
    pub fn session_count(&self) -> usize {
        self.state.relay.session_count()
    }

    /// Get registered key count (for monitoring)
    pub fn registered_count(&self) -> usize {
        self.state.relay.registry().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryStore;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = BrokerServer::new(&Config::default(), Arc::new(MemoryStore::new()));
        tokio::spawn(server.serve_listener(listener));
        addr
    }

    async fn client(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/socket", addr)).await.unwrap();
        ws
    }

    async fn emit(ws: &mut Client, frame: Value) {
        ws.send(Message::Text(frame.to_string())).await.unwrap();
    }

    async fn next_event(ws: &mut Client) -> Option<Value> {
        let frame = tokio::time::timeout(Duration::from_millis(500), ws.next()).await.ok()??;
        match frame.ok()? {
            Message::Text(text) => serde_json::from_str(&text).ok(),
            _ => None,
        }
    }

    #[test]
    fn test_server_creation() {
        let server = BrokerServer::new(&Config::default(), Arc::new(MemoryStore::new()));
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_request_over_websocket() {
        let addr = start().await;
        let mut alice = client(addr).await;
        let mut bob = client(addr).await;

        emit(&mut alice, json!({"event": "register", "data": "ALICE KEY"})).await;
        emit(&mut bob, json!({"event": "register", "data": "BOBKEY"})).await;
        // Let both registrations land before routing to them
        tokio::time::sleep(Duration::from_millis(100)).await;

        emit(
            &mut alice,
            json!({"event": "request-connection", "data": {"to": "BOB KEY", "from": "ALICEKEY"}}),
        )
        .await;
        assert_eq!(
            next_event(&mut bob).await,
            Some(json!({"event": "incoming-request", "data": {"from": "ALICEKEY"}}))
        );

        emit(
            &mut bob,
            json!({"event": "call-request", "data": {"to": "ALICEKEY", "from": "BOBKEY", "callType": "video"}}),
        )
        .await;
        assert_eq!(
            next_event(&mut alice).await,
            Some(json!({"event": "incoming-call", "data": {"from": "BOBKEY", "callType": "video"}}))
        );
    }

    #[tokio::test]
    async fn test_unroutable_and_malformed_frames_dropped() {
        let addr = start().await;
        let mut sender = client(addr).await;

        emit(&mut sender, json!({"event": "call-request", "data": {"to": "X", "from": "Y", "callType": "audio"}})).await;
        sender.send(Message::Text("not json".into())).await.unwrap();
        assert_eq!(next_event(&mut sender).await, None);

        // Session still usable afterwards
        emit(&mut sender, json!({"event": "register", "data": "Y"})).await;
        emit(&mut sender, json!({"event": "call-ended", "data": {"to": "Y", "from": "Y"}})).await;
        assert_eq!(
            next_event(&mut sender).await,
            Some(json!({"event": "call-ended", "data": {"from": "Y"}}))
        );
    }

    #[tokio::test]
    async fn test_room_signal_over_websocket() {
        let addr = start().await;
        let mut s1 = client(addr).await;
        let mut s2 = client(addr).await;
        let mut s3 = client(addr).await;

        emit(&mut s1, json!({"event": "join", "data": "R"})).await;
        emit(&mut s2, json!({"event": "join", "data": "R"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        emit(
            &mut s1,
            json!({"event": "signal", "data": {"room": "R", "payload": {"candidate": "c1"}}}),
        )
        .await;

        assert_eq!(
            next_event(&mut s2).await,
            Some(json!({"event": "signal", "data": {"candidate": "c1"}}))
        );
        assert_eq!(next_event(&mut s1).await, None);
        assert_eq!(next_event(&mut s3).await, None);
    }

    #[tokio::test]
    async fn test_disconnect_releases_registration() {
        let addr = start().await;
        let mut caller = client(addr).await;
        let mut first = client(addr).await;

        emit(&mut first, json!({"event": "register", "data": "K"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut second = client(addr).await;
        emit(&mut second, json!({"event": "register", "data": "K"})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        emit(&mut caller, json!({"event": "call-ended", "data": {"to": "K", "from": "C"}})).await;
        assert_eq!(
            next_event(&mut second).await,
            Some(json!({"event": "call-ended", "data": {"from": "C"}}))
        );
    }
}
