use serde::Serialize;

use crate::protocol::{BleEvent, Command, PeripheralDevice, SessionReport};
use crate::UNKNOWN_SENTINEL;

/// The application's view of the peripheral session. Only inbound events write it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub connected: bool,
    pub name: String,
    pub address: Option<String>,
    pub last_error: Option<String>,
}

impl Session {
    fn reset(last_error: Option<String>) -> Self {
        Self {
            connected: false,
            name: UNKNOWN_SENTINEL.to_string(),
            address: None,
            last_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Disconnected,
}

/// "No active session": no session at all, or the worker's three-part sentinel
/// `connected=false, name="Unknown", address=null`. Partial matches are a real session.
pub fn session_absent(session: Option<&Session>) -> bool {
    match session {
        None => true,
        Some(s) => !s.connected && s.name == UNKNOWN_SENTINEL && s.address.is_none(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConnectionStateMachine {
    scanning: bool,
    candidates: Vec<PeripheralDevice>,
    connecting: Option<String>,
    session: Option<Session>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&mut self) -> Command {
        self.scanning = true;
        Command::Scan
    }

    /// Records the attempt only; the session changes when the worker answers.
    pub fn connect(&mut self, address: &str) -> Command {
        self.connecting = Some(address.to_string());
        Command::Connect {
            address: address.to_string(),
        }
    }

    /// Fire-and-forget: the session resets when `ble-disconnect-result` echoes back.
    pub fn disconnect(&self) -> Command {
        Command::Disconnect
    }

    pub fn request_status(&self) -> Command {
        Command::Status
    }

    /// Applies one inbound event. Returns whether any observable state changed.
    pub fn apply(&mut self, ev: &BleEvent) -> bool {
        let before = (
            self.scanning,
            self.candidates.clone(),
            self.connecting.clone(),
            self.session.clone(),
        );
        match ev {
            BleEvent::ScanResult { data } => {
                self.scanning = false;
                self.candidates = data.clone();
            }
            BleEvent::StatusResult(report) => {
                let carried = self.session.as_ref().and_then(|s| s.last_error.clone());
                self.session = Some(session_from_report(report, carried));
                self.connecting = None;
            }
            BleEvent::ConnectResult(report) => {
                let failure = (!report.connected).then(|| {
                    let target = self.connecting.as_deref().unwrap_or(report.name.as_str());
                    format!("connection to {target} failed")
                });
                self.session = Some(session_from_report(report, failure));
                self.connecting = None;
            }
            BleEvent::DisconnectResult { success } => {
                let failure = (*success == Some(false))
                    .then(|| "worker reported disconnect failure".to_string());
                self.session = Some(Session::reset(failure));
            }
        }
        before
            != (
                self.scanning,
                self.candidates.clone(),
                self.connecting.clone(),
                self.session.clone(),
            )
    }

    /// No reply can cross a reconnect boundary, so pending local intents are dropped.
    pub fn on_channel_closed(&mut self) {
        self.scanning = false;
        self.connecting = None;
    }

    /// The command never left this process; undo the local intent it recorded.
    pub fn on_command_dropped(&mut self, cmd: &Command) {
        match cmd {
            Command::Scan => self.scanning = false,
            Command::Connect { address } => {
                if self.connecting.as_deref() == Some(address.as_str()) {
                    self.connecting = None;
                }
            }
            Command::Disconnect | Command::Status => {}
        }
    }

    pub fn is_session_absent(&self) -> bool {
        session_absent(self.session.as_ref())
    }

    pub fn phase(&self) -> Phase {
        if self.scanning {
            return Phase::Scanning;
        }
        if self.connecting.is_some() {
            return Phase::Connecting;
        }
        match &self.session {
            Some(s) if s.connected => Phase::Connected,
            Some(_) if !self.is_session_absent() => Phase::Disconnected,
            _ => Phase::Idle,
        }
    }

    pub fn scanning(&self) -> bool {
        self.scanning
    }

    pub fn candidates(&self) -> &[PeripheralDevice] {
        &self.candidates
    }

    pub fn connecting(&self) -> Option<&str> {
        self.connecting.as_deref()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

// `connected` without an address breaks the session invariant; such a report is
// downgraded to not-connected and flagged.
fn session_from_report(report: &SessionReport, last_error: Option<String>) -> Session {
    if report.connected && report.address.is_none() {
        return Session {
            connected: false,
            name: report.name.clone(),
            address: None,
            last_error: Some("worker reported connected without an address".to_string()),
        };
    }
    Session {
        connected: report.connected,
        name: report.name.clone(),
        address: report.address.clone(),
        last_error: if report.connected { None } else { last_error },
    }
}
