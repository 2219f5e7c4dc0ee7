use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use petlink_core::{
    device::{ConnectionStateMachine, Phase, Session},
    media::{AmplitudeLevels, MediaEventAggregator, MediaHistoryEntry, MediaSnapshot},
    protocol::{Command, Inbound, NotificationEvent, PeripheralDevice, WorkerEvent},
};
use petlink_observability::trace;

use crate::channel::{ChannelEvent, EventName, LinkState, MessageChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    Scan,
    Connect { address: String },
    Disconnect,
    RequestStatus,
}

/// Everything the UI renders, rebuilt after each handled event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanionView {
    pub link: LinkState,
    pub phase: Phase,
    pub scanning: bool,
    pub candidates: Vec<PeripheralDevice>,
    pub connecting: Option<String>,
    pub session: Option<Session>,
    pub session_absent: bool,
    pub media: Option<MediaSnapshot>,
    pub levels: Option<AmplitudeLevels>,
    pub history: Vec<MediaHistoryEntry>,
    pub last_notification: Option<NotificationEvent>,
}

/// State owned by the control loop. Nothing else mutates it.
#[derive(Debug, Clone)]
pub struct CompanionState {
    device: ConnectionStateMachine,
    media: MediaEventAggregator,
    link: LinkState,
    last_notification: Option<NotificationEvent>,
}

impl Default for CompanionState {
    fn default() -> Self {
        Self {
            device: ConnectionStateMachine::new(),
            media: MediaEventAggregator::new(),
            link: LinkState::Closed,
            last_notification: None,
        }
    }
}

impl CompanionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns commands to send in response.
    pub fn handle_channel(&mut self, ev: &ChannelEvent) -> Vec<Command> {
        match ev {
            ChannelEvent::Open => {
                self.link = LinkState::Open;
                // Resync after every (re)connect.
                vec![self.device.request_status()]
            }
            ChannelEvent::Close => {
                self.link = LinkState::Closed;
                self.device.on_channel_closed();
                Vec::new()
            }
            ChannelEvent::Message(msg) => {
                match msg {
                    Inbound::Ble(ble) => {
                        self.device.apply(ble);
                    }
                    Inbound::Worker(WorkerEvent::Media(m)) => {
                        self.media.ingest(m);
                    }
                    Inbound::Worker(WorkerEvent::Notification(n)) => {
                        self.last_notification = Some(n.clone());
                    }
                    Inbound::Unrecognized(_) | Inbound::Raw(_) => {}
                }
                Vec::new()
            }
        }
    }

    pub fn handle_ui(&mut self, cmd: &UiCommand) -> Command {
        match cmd {
            UiCommand::Scan => self.device.scan(),
            UiCommand::Connect { address } => self.device.connect(address),
            UiCommand::Disconnect => self.device.disconnect(),
            UiCommand::RequestStatus => self.device.request_status(),
        }
    }

    /// A command that could not be sent gets no reply, so its intent is undone.
    pub fn on_send_dropped(&mut self, cmd: &Command) {
        self.device.on_command_dropped(cmd);
    }

    pub fn view(&self) -> CompanionView {
        CompanionView {
            link: self.link,
            phase: self.device.phase(),
            scanning: self.device.scanning(),
            candidates: self.device.candidates().to_vec(),
            connecting: self.device.connecting().map(str::to_string),
            session: self.device.session().cloned(),
            session_absent: self.device.is_session_absent(),
            media: self.media.snapshot().cloned(),
            levels: self.media.levels(),
            history: self.media.history().cloned().collect(),
            last_notification: self.last_notification.clone(),
        }
    }
}

enum ControlEvent {
    Channel(ChannelEvent),
    Ui(UiCommand),
}

/// Cheap handle for UI code. Intents go in, views come out.
#[derive(Clone)]
pub struct CompanionHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
    view: watch::Receiver<CompanionView>,
}

impl CompanionHandle {
    pub fn submit(&self, cmd: UiCommand) -> bool {
        self.tx.send(ControlEvent::Ui(cmd)).is_ok()
    }

    pub fn scan(&self) -> bool {
        self.submit(UiCommand::Scan)
    }

    pub fn connect(&self, address: &str) -> bool {
        self.submit(UiCommand::Connect {
            address: address.to_string(),
        })
    }

    pub fn disconnect(&self) -> bool {
        self.submit(UiCommand::Disconnect)
    }

    pub fn request_status(&self) -> bool {
        self.submit(UiCommand::RequestStatus)
    }

    pub fn view(&self) -> CompanionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CompanionView> {
        self.view.clone()
    }
}

/// Wires channel listeners into a single control task and starts the channel.
/// Must run inside a Tokio runtime.
pub fn start(channel: &MessageChannel, endpoint: &str, data_dir: &Path) -> CompanionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    for name in [EventName::Open, EventName::Message, EventName::Close] {
        let tx = tx.clone();
        channel.on(name, move |ev| {
            let _ = tx.send(ControlEvent::Channel(ev.clone()));
        });
    }

    let state = CompanionState::new();
    let (view_tx, view_rx) = watch::channel(state.view());
    tokio::spawn(control_loop(
        state,
        rx,
        channel.clone(),
        view_tx,
        data_dir.to_path_buf(),
    ));
    channel.connect(endpoint);

    CompanionHandle { tx, view: view_rx }
}

async fn control_loop(
    mut state: CompanionState,
    mut rx: mpsc::UnboundedReceiver<ControlEvent>,
    channel: MessageChannel,
    view_tx: watch::Sender<CompanionView>,
    data_dir: PathBuf,
) {
    while let Some(ev) = rx.recv().await {
        let outbound = match &ev {
            ControlEvent::Channel(ch) => {
                if let ChannelEvent::Message(msg @ (Inbound::Raw(_) | Inbound::Unrecognized(_))) =
                    ch
                {
                    trace::event(
                        &data_dir,
                        None,
                        "Companion",
                        "COMP.inbound",
                        "skipped",
                        Some(serde_json::json!({"kind": msg.kind()})),
                    );
                }
                state.handle_channel(ch)
            }
            ControlEvent::Ui(cmd) => vec![state.handle_ui(cmd)],
        };
        for cmd in &outbound {
            if !channel.send(cmd) {
                state.on_send_dropped(cmd);
            }
        }

        let next = state.view();
        view_tx.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            *cur = next;
            true
        });
    }
}
