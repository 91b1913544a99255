//! Per-client pumps.
//!
//! Each connection runs two loops. The inbound pump reads frames, calls the
//! inference gateway and submits the replies to the hub. The outbound pump
//! drains the connection's queue onto the socket and sends keepalive pings.
//! The inbound pump is the only one that unregisters; the outbound pump
//! signals it through a token when the socket can no longer be written.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use parley_core::gateway::InferenceGateway;
use parley_core::ids::{ConnectionId, SessionId};
use parley_core::inference::InferenceRequest;
use parley_core::message::Message;
use parley_settings::{DeliveryMode, ServerSettings};

use crate::hub::{Delivery, Frame, HubHandle};
use crate::relay;

#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Outbound queue capacity. The hub evicts the connection when it is full.
    pub outbound_capacity: usize,
    pub ping_interval: Duration,
    pub delivery: DeliveryMode,
}

impl ConnectionOptions {
    pub fn from_settings(server: &ServerSettings, delivery: DeliveryMode) -> Self {
        Self {
            outbound_capacity: server.send_queue(),
            ping_interval: server.ping_interval(),
            delivery,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default(), DeliveryMode::default())
    }
}

pub struct Connection {
    id: ConnectionId,
    session_id: SessionId,
    hub: HubHandle,
    gateway: Arc<dyn InferenceGateway>,
    options: ConnectionOptions,
}

impl Connection {
    pub fn new(
        hub: HubHandle,
        gateway: Arc<dyn InferenceGateway>,
        session_id: SessionId,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            session_id,
            hub,
            gateway,
            options,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Drive an upgraded socket until either side ends it.
    pub async fn serve(self, socket: WebSocket) {
        let (writer, reader) = socket.split();
        self.run(reader, writer).await;
    }

    /// Register with the hub, spawn the outbound pump and run the inbound
    /// pump on the current task. Returns once both pumps have stopped.
    pub async fn run<R, W, E>(self, reader: R, mut writer: W)
    where
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
        E: Display + Send,
        W: Sink<WsMessage> + Unpin + Send + 'static,
        W::Error: Display + Send,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.options.outbound_capacity.max(1));
        if let Err(e) = self.hub.register(self.id.clone(), outbound_tx).await {
            warn!(conn_id = %self.id, error = %e, "registration rejected, closing");
            let _ = writer.send(WsMessage::Close(None)).await;
            return;
        }
        info!(conn_id = %self.id, session_id = %self.session_id, "client connected");

        let released = CancellationToken::new();
        let outbound = tokio::spawn(outbound_pump(
            self.id.clone(),
            outbound_rx,
            writer,
            self.options.ping_interval,
            released.clone(),
        ));

        self.inbound(reader, &released).await;
        self.hub.unregister(&self.id).await;

        if let Err(e) = outbound.await {
            error!(conn_id = %self.id, error = %e, "outbound pump panicked");
        }
        info!(conn_id = %self.id, "client disconnected");
    }

    async fn inbound<R, E>(&self, mut reader: R, released: &CancellationToken)
    where
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
        E: Display + Send,
    {
        loop {
            let frame = tokio::select! {
                () = released.cancelled() => {
                    debug!(conn_id = %self.id, "socket released by outbound pump");
                    break;
                }
                frame = reader.next() => frame,
            };

            let parsed = match frame {
                None => break,
                Some(Err(e)) => {
                    debug!(conn_id = %self.id, error = %e, "read failed");
                    break;
                }
                Some(Ok(WsMessage::Close(_))) => {
                    debug!(conn_id = %self.id, "client sent close frame");
                    break;
                }
                Some(Ok(WsMessage::Text(text))) => parse(text.as_str().as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => parse(&data),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            };

            match parsed {
                Some(message) => self.relay(message).await,
                None => trace!(conn_id = %self.id, "ignoring malformed frame"),
            }
        }
    }

    /// Ask the gateway and submit its replies. Only user messages are answered.
    async fn relay(&self, message: Message) {
        if !message.is_from_user() {
            trace!(conn_id = %self.id, "ignoring non-user message");
            return;
        }

        let request = InferenceRequest::from_message(&message, self.session_id.clone());
        debug!(conn_id = %self.id, kind = ?message.kind, "forwarding to inference");
        let outcome = self.gateway.infer(&request).await;
        if let Err(e) = &outcome {
            warn!(
                conn_id = %self.id,
                session_id = %self.session_id,
                kind = e.kind(),
                error = %e,
                "inference failed"
            );
        }

        for reply in relay::replies(&outcome) {
            let payload = match reply.to_json() {
                Ok(json) => Arc::new(json),
                Err(e) => {
                    error!(conn_id = %self.id, error = %e, "failed to serialize reply");
                    continue;
                }
            };
            if self.hub.broadcast(payload, self.delivery()).await.is_err() {
                debug!(conn_id = %self.id, "hub stopped, reply dropped");
                return;
            }
        }
    }

    fn delivery(&self) -> Delivery {
        match self.options.delivery {
            DeliveryMode::Broadcast => Delivery::All,
            DeliveryMode::Origin => Delivery::Only(self.id.clone()),
        }
    }
}

/// Malformed frames are dropped without a reply.
fn parse(bytes: &[u8]) -> Option<Message> {
    serde_json::from_slice(bytes).ok()
}

/// Drain `queue` onto `writer` until the queue closes or a write fails.
///
/// A closed queue means the hub removed this connection, so a close frame is
/// sent first. `released` is cancelled on every exit path.
pub async fn outbound_pump<W>(
    id: ConnectionId,
    mut queue: mpsc::Receiver<Frame>,
    mut writer: W,
    ping_interval: Duration,
    released: CancellationToken,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let mut ping = tokio::time::interval(ping_interval);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            frame = queue.recv() => {
                let Some(frame) = frame else {
                    trace!(conn_id = %id, "queue closed, sending close frame");
                    let _ = writer.send(WsMessage::Close(None)).await;
                    break;
                };
                if let Err(e) = writer.send(WsMessage::Text(frame.as_str().into())).await {
                    debug!(conn_id = %id, error = %e, "write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = writer.send(WsMessage::Ping(vec![].into())).await {
                    debug!(conn_id = %id, error = %e, "ping failed");
                    break;
                }
                trace!(conn_id = %id, "sent ping");
            }
        }
    }

    let _ = writer.close().await;
    released.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as chan;
    use parley_core::errors::GatewayError;
    use parley_core::message::{MessageKind, Speaker, INFERENCE_UNAVAILABLE};
    use parley_gateway::{MockGateway, MockReply};
    use tokio::task::JoinHandle;

    use crate::hub::Hub;

    type Inbound = Result<WsMessage, std::io::Error>;

    /// The client's end of an in-memory socket.
    struct Client {
        to_server: chan::UnboundedSender<Inbound>,
        from_server: chan::UnboundedReceiver<WsMessage>,
    }

    impl Client {
        fn say(&self, message: &Message) {
            let json = message.to_json().unwrap();
            self.to_server
                .unbounded_send(Ok(WsMessage::Text(json.into())))
                .unwrap();
        }

        fn send_raw(&self, frame: WsMessage) {
            self.to_server.unbounded_send(Ok(frame)).unwrap();
        }

        /// Next data or close frame, skipping pings.
        async fn next(&mut self) -> WsMessage {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(2), self.from_server.next())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("server side dropped");
                if !matches!(frame, WsMessage::Ping(_)) {
                    return frame;
                }
            }
        }

        async fn next_message(&mut self) -> Message {
            match self.next().await {
                WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    struct Harness {
        hub: HubHandle,
        shutdown: CancellationToken,
    }

    impl Harness {
        fn start() -> Self {
            let (hub, handle) = Hub::new();
            let shutdown = CancellationToken::new();
            let _ = hub.spawn(shutdown.clone());
            Self {
                hub: handle,
                shutdown,
            }
        }

        fn connect(
            &self,
            gateway: Arc<dyn InferenceGateway>,
            options: ConnectionOptions,
        ) -> (Client, JoinHandle<()>) {
            let (to_server, reader) = chan::unbounded::<Inbound>();
            let (writer, from_server) = chan::unbounded::<WsMessage>();
            let conn = Connection::new(self.hub.clone(), gateway, SessionId::from_raw("sess_t"), options);
            let task = tokio::spawn(conn.run(reader, writer));
            (
                Client {
                    to_server,
                    from_server,
                },
                task,
            )
        }

        async fn wait_for_live(&self, n: usize) {
            for _ in 0..200 {
                if self.hub.stats().live_connections == n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("expected {n} live connections, have {}", self.hub.stats().live_connections);
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn user_text(content: &str) -> Message {
        Message::text(content, Speaker::User)
    }

    #[tokio::test]
    async fn text_reply_reaches_every_connection() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("hi there")));
        let (mut alice, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        let (mut bob, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        h.wait_for_live(2).await;

        alice.say(&user_text("hello"));

        let expected = Message::text("hi there", Speaker::Ai);
        assert_eq!(alice.next_message().await, expected);
        assert_eq!(bob.next_message().await, expected);

        let requests = gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message.as_deref(), Some("hello"));
        assert_eq!(requests[0].session_id.as_str(), "sess_t");
    }

    #[tokio::test]
    async fn audio_reply_sends_transcript_then_audio() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text_and_audio("spoken", "SUQz")));
        let (mut client, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        h.wait_for_live(1).await;

        client.say(&Message::audio("UklGRg==", Speaker::User));

        let first = client.next_message().await;
        let second = client.next_message().await;
        assert_eq!(first, Message::text("spoken", Speaker::Ai));
        assert_eq!(second, Message::audio("SUQz", Speaker::Ai));
        assert_eq!(gateway.requests()[0].audio_data.as_deref(), Some("UklGRg=="));
        assert!(gateway.requests()[0].message.is_none());
    }

    #[tokio::test]
    async fn gateway_failure_sends_apology() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::new(vec![MockReply::Error(GatewayError::Timeout(
            Duration::from_secs(30),
        ))]));
        let (mut client, _) = h.connect(gateway, ConnectionOptions::default());
        h.wait_for_live(1).await;

        client.say(&user_text("hello"));

        let reply = client.next_message().await;
        assert_eq!(reply.kind, MessageKind::System);
        assert_eq!(reply.content, INFERENCE_UNAVAILABLE);
        assert_eq!(reply.sender, Speaker::Ai);
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (mut client, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        h.wait_for_live(1).await;

        client.send_raw(WsMessage::Text("not json".into()));
        client.send_raw(WsMessage::Text(r#"{"type":"video","content":"x","sender":"user"}"#.into()));
        client.send_raw(WsMessage::Ping(vec![1].into()));
        client.say(&user_text("still here"));

        // The first frame out is the answer to the valid message.
        assert_eq!(client.next_message().await, Message::text("ok", Speaker::Ai));
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(h.hub.stats().live_connections, 1);
    }

    #[tokio::test]
    async fn binary_frames_are_parsed() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (mut client, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        h.wait_for_live(1).await;

        let json = user_text("bytes").to_json().unwrap();
        client.send_raw(WsMessage::Binary(json.into_bytes().into()));

        assert_eq!(client.next_message().await, Message::text("ok", Speaker::Ai));
        assert_eq!(gateway.requests()[0].message.as_deref(), Some("bytes"));
    }

    #[tokio::test]
    async fn ai_messages_are_not_answered() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (mut client, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        h.wait_for_live(1).await;

        client.say(&Message::text("echo", Speaker::Ai));
        client.say(&user_text("real"));

        assert_eq!(client.next_message().await, Message::text("ok", Speaker::Ai));
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn pending_inference_survives_requester_disconnect() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::delayed(
            Duration::from_millis(300),
            MockReply::text("late"),
        )));
        let (alice, alice_task) = h.connect(gateway.clone(), ConnectionOptions::default());
        let (mut bob, _) = h.connect(gateway.clone(), ConnectionOptions::default());
        h.wait_for_live(2).await;

        alice.say(&user_text("slow question"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        alice.send_raw(WsMessage::Close(None));
        drop(alice);

        assert_eq!(bob.next_message().await, Message::text("late", Speaker::Ai));
        tokio::time::timeout(Duration::from_secs(2), alice_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gateway.call_count(), 1);
        h.wait_for_live(1).await;
    }

    #[tokio::test]
    async fn origin_delivery_reaches_only_requester() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("private")));
        let origin = ConnectionOptions {
            delivery: DeliveryMode::Origin,
            ..ConnectionOptions::default()
        };
        let (mut alice, _) = h.connect(gateway.clone(), origin.clone());
        let (mut bob, _) = h.connect(gateway.clone(), origin);
        h.wait_for_live(2).await;

        alice.say(&user_text("just me"));
        assert_eq!(alice.next_message().await, Message::text("private", Speaker::Ai));

        bob.say(&user_text("and me"));
        assert_eq!(bob.next_message().await, Message::text("private", Speaker::Ai));
        assert_eq!(h.hub.stats().delivered, 2);
    }

    #[tokio::test]
    async fn client_close_unregisters() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (mut client, task) = h.connect(gateway, ConnectionOptions::default());
        h.wait_for_live(1).await;

        client.send_raw(WsMessage::Close(None));

        assert!(matches!(client.next().await, WsMessage::Close(_)));
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(h.hub.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn read_error_unregisters() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (client, task) = h.connect(gateway, ConnectionOptions::default());
        h.wait_for_live(1).await;

        client
            .to_server
            .unbounded_send(Err(std::io::Error::other("connection reset")))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(h.hub.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn write_failure_ends_both_pumps() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (client, task) = h.connect(gateway, ConnectionOptions::default());
        h.wait_for_live(1).await;

        // The client stops reading; the next write fails.
        drop(client.from_server);
        h.hub
            .broadcast(Arc::new("{}".to_string()), Delivery::All)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(h.hub.stats().live_connections, 0);
    }

    #[tokio::test]
    async fn hub_shutdown_sends_close_frame() {
        let h = Harness::start();
        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (mut client, task) = h.connect(gateway, ConnectionOptions::default());
        h.wait_for_live(1).await;

        h.shutdown.cancel();

        assert!(matches!(client.next().await, WsMessage::Close(_)));
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stopped_hub_closes_immediately() {
        let h = Harness::start();
        h.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let gateway = Arc::new(MockGateway::always(MockReply::text("ok")));
        let (mut client, task) = h.connect(gateway.clone(), ConnectionOptions::default());

        assert!(matches!(client.next().await, WsMessage::Close(_)));
        task.await.unwrap();
        assert_eq!(gateway.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_pump_pings_when_idle() {
        let (_queue_tx, queue_rx) = mpsc::channel::<Frame>(4);
        let (writer, mut from_server) = chan::unbounded::<WsMessage>();
        let released = CancellationToken::new();
        let _pump = tokio::spawn(outbound_pump(
            ConnectionId::new(),
            queue_rx,
            writer,
            Duration::from_secs(30),
            released.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(matches!(from_server.next().await, Some(WsMessage::Ping(_))));
        assert!(!released.is_cancelled());
    }

    #[tokio::test]
    async fn outbound_pump_closes_after_draining() {
        let (queue_tx, queue_rx) = mpsc::channel::<Frame>(4);
        let (writer, from_server) = chan::unbounded::<WsMessage>();
        let released = CancellationToken::new();

        queue_tx.send(Arc::new("a".into())).await.unwrap();
        queue_tx.send(Arc::new("b".into())).await.unwrap();
        drop(queue_tx);

        outbound_pump(
            ConnectionId::new(),
            queue_rx,
            writer,
            Duration::from_secs(30),
            released.clone(),
        )
        .await;

        let frames: Vec<WsMessage> = from_server.collect().await;
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], WsMessage::Text(t) if t.as_str() == "a"));
        assert!(matches!(&frames[1], WsMessage::Text(t) if t.as_str() == "b"));
        assert!(matches!(frames[2], WsMessage::Close(None)));
        assert!(released.is_cancelled());
    }
}
