use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use petlink_core::protocol::{self, Command, Inbound};
use petlink_observability::trace;

// Failed attempts are traced on the first failure of a streak and then every Nth.
const FAILURE_TRACE_EVERY: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Open,
    Message,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(Inbound),
    Close,
}

impl ChannelEvent {
    pub fn name(&self) -> EventName {
        match self {
            ChannelEvent::Open => EventName::Open,
            ChannelEvent::Message(_) => EventName::Message,
            ChannelEvent::Close => EventName::Close,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

pub type Callback = Box<dyn FnMut(&ChannelEvent) + Send>;

/// Listeners keyed by event name. Outlives every connection; callbacks fire in
/// registration order.
#[derive(Default)]
pub struct SubscriberRegistry {
    open: Vec<Callback>,
    message: Vec<Callback>,
    close: Vec<Callback>,
}

impl SubscriberRegistry {
    fn slot(&mut self, name: EventName) -> &mut Vec<Callback> {
        match name {
            EventName::Open => &mut self.open,
            EventName::Message => &mut self.message,
            EventName::Close => &mut self.close,
        }
    }

    pub fn register(&mut self, name: EventName, cb: Callback) {
        self.slot(name).push(cb);
    }

    /// Returns how many callbacks ran.
    pub fn dispatch(&mut self, ev: &ChannelEvent) -> usize {
        let slot = self.slot(ev.name());
        for cb in slot.iter_mut() {
            cb(ev);
        }
        slot.len()
    }

    pub fn len(&self, name: EventName) -> usize {
        match name {
            EventName::Open => self.open.len(),
            EventName::Message => self.message.len(),
            EventName::Close => self.close.len(),
        }
    }
}

struct Link {
    state: LinkState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

struct Shared {
    data_dir: PathBuf,
    registry: Mutex<SubscriberRegistry>,
    link: Mutex<Link>,
    started: AtomicBool,
    attempts: AtomicU64,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_link(&self, state: LinkState, outbound: Option<mpsc::UnboundedSender<Message>>) {
        let mut g = self.link();
        g.state = state;
        g.outbound = outbound;
    }

    fn dispatch(&self, ev: &ChannelEvent) {
        let mut reg = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        reg.dispatch(ev);
    }
}

/// Persistent duplex connection to the worker. Reconnects forever after a fixed
/// delay; at most one connection is live at a time.
///
/// Callbacks run on the connection task while the registry is locked, so they
/// must not call [`MessageChannel::on`].
#[derive(Clone)]
pub struct MessageChannel {
    shared: Arc<Shared>,
    retry_delay: Duration,
}

impl MessageChannel {
    pub fn new(data_dir: &Path, retry_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                data_dir: data_dir.to_path_buf(),
                registry: Mutex::new(SubscriberRegistry::default()),
                link: Mutex::new(Link {
                    state: LinkState::Closed,
                    outbound: None,
                }),
                started: AtomicBool::new(false),
                attempts: AtomicU64::new(0),
            }),
            retry_delay,
        }
    }

    pub fn on<F>(&self, name: EventName, f: F)
    where
        F: FnMut(&ChannelEvent) + Send + 'static,
    {
        let mut reg = self.shared.registry.lock().unwrap_or_else(|p| p.into_inner());
        reg.register(name, Box::new(f));
    }

    pub fn subscriber_count(&self, name: EventName) -> usize {
        let reg = self.shared.registry.lock().unwrap_or_else(|p| p.into_inner());
        reg.len(name)
    }

    pub fn state(&self) -> LinkState {
        self.shared.link().state
    }

    /// Connection attempts made so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Starts the connect/reconnect loop on the current Tokio runtime.
    /// Returns `false` if the loop is already running.
    pub fn connect(&self, endpoint: &str) -> bool {
        if self
            .shared
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        trace::event(
            &self.shared.data_dir,
            None,
            "Channel",
            "CH.start",
            "ok",
            Some(serde_json::json!({
                "endpoint": endpoint,
                "retry_delay_ms": self.retry_delay.as_millis(),
            })),
        );
        tokio::spawn(reconnect_loop(
            self.shared.clone(),
            endpoint.to_string(),
            self.retry_delay,
        ));
        true
    }

    /// Sends only while open. Otherwise the command is dropped and traced; there
    /// is no outbound queue.
    pub fn send(&self, cmd: &Command) -> bool {
        let payload = match cmd.encode() {
            Ok(p) => p,
            Err(e) => {
                trace::event(
                    &self.shared.data_dir,
                    None,
                    "Channel",
                    "CH.send",
                    "err",
                    Some(serde_json::json!({"code": "E_CHANNEL_ENCODE", "command": cmd.name(), "error": e.to_string()})),
                );
                return false;
            }
        };

        let state = {
            let link = self.shared.link();
            if let (LinkState::Open, Some(tx)) = (link.state, link.outbound.as_ref()) {
                if tx.send(Message::Text(payload)).is_ok() {
                    return true;
                }
            }
            link.state
        };
        trace::event(
            &self.shared.data_dir,
            None,
            "Channel",
            "CH.send",
            "skipped",
            Some(serde_json::json!({"command": cmd.name(), "state": state})),
        );
        false
    }
}

async fn reconnect_loop(shared: Arc<Shared>, endpoint: String, retry_delay: Duration) {
    let mut failures: u64 = 0;
    loop {
        let opened = run_connection(&shared, &endpoint, failures).await;
        failures = if opened { 0 } else { failures + 1 };
        shared.set_link(LinkState::Closed, None);
        shared.dispatch(&ChannelEvent::Close);
        tokio::time::sleep(retry_delay).await;
    }
}

/// One connection lifetime. Returns whether the connection ever opened.
async fn run_connection(shared: &Shared, endpoint: &str, prior_failures: u64) -> bool {
    shared.set_link(LinkState::Connecting, None);
    let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;

    let ws = match connect_async(endpoint).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            let streak = prior_failures + 1;
            if streak == 1 || streak % FAILURE_TRACE_EVERY == 0 {
                trace::event(
                    &shared.data_dir,
                    None,
                    "Channel",
                    "CH.connect",
                    "err",
                    Some(serde_json::json!({
                        "code": "E_CHANNEL_CONNECT",
                        "endpoint": endpoint,
                        "attempt": attempt,
                        "failure_streak": streak,
                        "error": e.to_string(),
                    })),
                );
            }
            return false;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared.set_link(LinkState::Open, Some(tx));
    trace::event(
        &shared.data_dir,
        None,
        "Channel",
        "CH.open",
        "ok",
        Some(serde_json::json!({"endpoint": endpoint, "attempt": attempt})),
    );
    shared.dispatch(&ChannelEvent::Open);

    let close_reason = loop {
        tokio::select! {
            out = rx.recv() => {
                let Some(msg) = out else { break "outbound_closed".to_string() };
                if let Err(e) = sink.send(msg).await {
                    break format!("send failed: {e}");
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    shared.dispatch(&ChannelEvent::Message(protocol::decode(&text)));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    shared.dispatch(&ChannelEvent::Message(protocol::decode(&text)));
                }
                Some(Ok(Message::Close(_))) => break "peer_closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("receive failed: {e}"),
                None => break "stream_ended".to_string(),
            }
        }
    };

    trace::event(
        &shared.data_dir,
        None,
        "Channel",
        "CH.close",
        "ok",
        Some(serde_json::json!({"endpoint": endpoint, "reason": close_reason})),
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use petlink_core::protocol::BleEvent;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("ws://{}", listener.local_addr().expect("addr"));
        (listener, url)
    }

    fn record_all(ch: &MessageChannel) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for name in [EventName::Open, EventName::Message, EventName::Close] {
            let tx = tx.clone();
            ch.on(name, move |ev| {
                let _ = tx.send(ev.clone());
            });
        }
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("recorder closed")
    }

    #[test]
    fn registry_fires_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut reg = SubscriberRegistry::default();
        for i in 0..3 {
            let order = order.clone();
            reg.register(
                EventName::Message,
                Box::new(move |_| order.lock().unwrap().push(i)),
            );
        }
        assert_eq!(reg.dispatch(&ChannelEvent::Open), 0);
        assert_eq!(reg.dispatch(&ChannelEvent::Message(Inbound::Raw("x".into()))), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(reg.len(EventName::Message), 3);
        assert_eq!(reg.len(EventName::Close), 0);
    }

    #[test]
    fn send_before_connect_is_dropped() {
        let td = tempfile::tempdir().expect("tempdir");
        let ch = MessageChannel::new(td.path(), Duration::from_millis(10));
        assert_eq!(ch.state(), LinkState::Closed);
        assert!(!ch.send(&Command::Scan));
    }

    #[tokio::test]
    async fn reconnects_after_peer_close_and_keeps_subscribers() {
        let td = tempfile::tempdir().expect("tempdir");
        let (listener, url) = bind().await;
        let ch = MessageChannel::new(td.path(), Duration::from_millis(50));
        let mut rx = record_all(&ch);

        let server = tokio::spawn(async move {
            let (s, _) = listener.accept().await.expect("accept 1");
            let mut ws = accept_async(s).await.expect("handshake 1");
            ws.send(Message::Text(r#"{"event":"ble-disconnect-result"}"#.to_string()))
                .await
                .expect("send 1");
            ws.close(None).await.expect("close 1");
            while let Some(Ok(_)) = ws.next().await {}

            let (s, _) = listener.accept().await.expect("accept 2");
            let mut ws = accept_async(s).await.expect("handshake 2");
            ws.send(Message::Text("not json".to_string()))
                .await
                .expect("send 2");
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(t))) => return t,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            }
        });

        assert!(ch.connect(&url));
        assert!(!ch.connect(&url));

        assert_eq!(next(&mut rx).await, ChannelEvent::Open);
        assert_eq!(
            next(&mut rx).await,
            ChannelEvent::Message(Inbound::Ble(BleEvent::DisconnectResult { success: None }))
        );
        assert_eq!(next(&mut rx).await, ChannelEvent::Close);
        assert_eq!(next(&mut rx).await, ChannelEvent::Open);
        assert_eq!(
            next(&mut rx).await,
            ChannelEvent::Message(Inbound::Raw("not json".to_string()))
        );

        assert_eq!(ch.state(), LinkState::Open);
        assert!(ch.send(&Command::Scan));
        let got = timeout(WAIT, server)
            .await
            .expect("server timed out")
            .expect("server task");
        assert_eq!(got, r#"{"event":"ble-scan"}"#);
        assert_eq!(ch.attempts(), 2);
        assert_eq!(ch.subscriber_count(EventName::Open), 1);
    }

    #[tokio::test]
    async fn unreachable_peer_retries_indefinitely() {
        let td = tempfile::tempdir().expect("tempdir");
        let (listener, url) = bind().await;
        drop(listener);

        let ch = MessageChannel::new(td.path(), Duration::from_millis(20));
        let mut rx = record_all(&ch);
        ch.connect(&url);

        for _ in 0..4 {
            assert_eq!(next(&mut rx).await, ChannelEvent::Close);
        }
        assert!(ch.attempts() >= 4);
        assert_ne!(ch.state(), LinkState::Open);
        assert!(!ch.send(&Command::Status));
        // Failed attempts do not accumulate listeners.
        assert_eq!(ch.subscriber_count(EventName::Close), 1);
        assert_eq!(ch.subscriber_count(EventName::Open), 1);
    }

    #[tokio::test]
    async fn waits_the_fixed_delay_before_reconnecting() {
        let td = tempfile::tempdir().expect("tempdir");
        let (listener, url) = bind().await;
        let delay = Duration::from_millis(250);
        let ch = MessageChannel::new(td.path(), delay);

        let (tx, mut closes) = mpsc::unbounded_channel();
        ch.on(EventName::Close, move |_| {
            let _ = tx.send(std::time::Instant::now());
        });

        let server = tokio::spawn(async move {
            let (s, _) = listener.accept().await.expect("accept 1");
            let mut ws = accept_async(s).await.expect("handshake 1");
            ws.close(None).await.expect("close 1");
            while let Some(Ok(_)) = ws.next().await {}

            let (s, _) = listener.accept().await.expect("accept 2");
            let reaccepted = std::time::Instant::now();
            let ws = accept_async(s).await.expect("handshake 2");
            (reaccepted, ws)
        });

        ch.connect(&url);
        let closed_at = timeout(WAIT, closes.recv())
            .await
            .expect("timed out waiting for close")
            .expect("recorder closed");
        let (reaccepted, _ws) = timeout(WAIT, server)
            .await
            .expect("server timed out")
            .expect("server task");

        let gap = reaccepted.duration_since(closed_at);
        assert!(gap >= delay, "reconnected after {gap:?}, expected at least {delay:?}");
        assert_eq!(ch.attempts(), 2);
    }
}
