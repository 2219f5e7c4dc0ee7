use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use petlink_observability::trace;
use petlink_platform::ProcessSupervisor;

/// Window/tray operations the controller drives. Implemented by the desktop
/// shell; tests use a recording fake.
pub trait WindowShell {
    fn window_exists(&self) -> bool;
    fn create_window(&mut self) -> Result<()>;
    fn show_window(&mut self) -> Result<()>;
    fn hide_window(&mut self) -> Result<()>;
    fn notify_background(&mut self) -> Result<()>;
    fn remove_tray(&mut self);
    fn exit_app(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Visible,
    Hidden,
    /// Terminal.
    Quitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Veto the close; the window was hidden instead.
    Hide,
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackgroundNotice {
    Pending,
    Sent,
}

pub struct WindowLifecycleController {
    state: Lifecycle,
    notice: BackgroundNotice,
    torn_down: bool,
    data_dir: PathBuf,
}

impl WindowLifecycleController {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            state: Lifecycle::Visible,
            notice: BackgroundNotice::Pending,
            torn_down: false,
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    fn trace_step(&self, step_id: &str, status: &str, ctx: Option<serde_json::Value>) {
        trace::event(&self.data_dir, None, "Lifecycle", step_id, status, ctx);
    }

    /// A user close hides to tray unless a quit is underway.
    pub fn on_close_requested(&mut self, shell: &mut dyn WindowShell) -> CloseDecision {
        if self.state == Lifecycle::Quitting {
            return CloseDecision::Allow;
        }
        if let Err(e) = shell.hide_window() {
            self.trace_step(
                "LIFE.hide",
                "err",
                Some(serde_json::json!({"code": "E_WINDOW_HIDE", "error": format!("{e:#}")})),
            );
        }
        self.state = Lifecycle::Hidden;

        if self.notice == BackgroundNotice::Pending {
            // Latched even when delivery fails: the notice is shown at most once per run.
            self.notice = BackgroundNotice::Sent;
            if let Err(e) = shell.notify_background() {
                self.trace_step(
                    "LIFE.notify",
                    "err",
                    Some(serde_json::json!({"code": "E_NOTIFY", "error": format!("{e:#}")})),
                );
            }
        }
        CloseDecision::Hide
    }

    /// Shows the main window, recreating it if it was destroyed.
    pub fn on_tray_show(&mut self, shell: &mut dyn WindowShell) {
        if self.state == Lifecycle::Quitting {
            return;
        }
        self.present(shell);
    }

    pub fn on_tray_exit(&mut self, shell: &mut dyn WindowShell) {
        self.request_quit(shell);
    }

    /// Enters `Quitting`, removes the tray and asks the shell to exit.
    /// Later calls are ignored.
    pub fn request_quit(&mut self, shell: &mut dyn WindowShell) {
        if self.state == Lifecycle::Quitting {
            return;
        }
        self.state = Lifecycle::Quitting;
        self.trace_step("LIFE.quit", "ok", None);
        shell.remove_tray();
        shell.exit_app();
    }

    /// Application reactivation (dock click and the like).
    pub fn on_reactivate(&mut self, shell: &mut dyn WindowShell, open_windows: usize) {
        if self.state == Lifecycle::Quitting || open_windows > 0 {
            return;
        }
        self.present(shell);
    }

    /// Process exit hook. Stops the worker exactly once, whatever path led here.
    pub fn on_exit(&mut self, supervisor: &ProcessSupervisor) {
        self.state = Lifecycle::Quitting;
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        supervisor.terminate();
    }

    fn present(&mut self, shell: &mut dyn WindowShell) {
        let res = if shell.window_exists() {
            shell.show_window()
        } else {
            shell.create_window()
        };
        match res {
            Ok(()) => self.state = Lifecycle::Visible,
            Err(e) => self.trace_step(
                "LIFE.show",
                "err",
                Some(serde_json::json!({"code": "E_WINDOW_SHOW", "error": format!("{e:#}")})),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use petlink_platform::{RunContext, TerminationStrategy};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct FakeShell {
        window: bool,
        calls: Vec<&'static str>,
        fail_notify: bool,
    }

    impl FakeShell {
        fn with_window() -> Self {
            Self {
                window: true,
                ..Self::default()
            }
        }

        fn count(&self, name: &str) -> usize {
            self.calls.iter().filter(|c| **c == name).count()
        }
    }

    impl WindowShell for FakeShell {
        fn window_exists(&self) -> bool {
            self.window
        }
        fn create_window(&mut self) -> Result<()> {
            self.calls.push("create");
            self.window = true;
            Ok(())
        }
        fn show_window(&mut self) -> Result<()> {
            self.calls.push("show");
            Ok(())
        }
        fn hide_window(&mut self) -> Result<()> {
            self.calls.push("hide");
            Ok(())
        }
        fn notify_background(&mut self) -> Result<()> {
            self.calls.push("notify");
            if self.fail_notify {
                return Err(anyhow!("notifications disabled"));
            }
            Ok(())
        }
        fn remove_tray(&mut self) {
            self.calls.push("remove_tray");
        }
        fn exit_app(&mut self) {
            self.calls.push("exit");
        }
    }

    struct CountingKill(AtomicUsize);

    impl TerminationStrategy for CountingKill {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn terminate(&self, _pid: u32) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn close_hides_and_notifies_only_once() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctl = WindowLifecycleController::new(td.path());
        let mut shell = FakeShell::with_window();

        assert_eq!(ctl.on_close_requested(&mut shell), CloseDecision::Hide);
        assert_eq!(ctl.state(), Lifecycle::Hidden);
        ctl.on_tray_show(&mut shell);
        assert_eq!(ctl.state(), Lifecycle::Visible);
        assert_eq!(ctl.on_close_requested(&mut shell), CloseDecision::Hide);

        assert_eq!(shell.count("hide"), 2);
        assert_eq!(shell.count("notify"), 1);
        assert_eq!(shell.count("exit"), 0);
    }

    #[test]
    fn failed_notice_is_not_retried() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctl = WindowLifecycleController::new(td.path());
        let mut shell = FakeShell {
            window: true,
            fail_notify: true,
            ..FakeShell::default()
        };
        ctl.on_close_requested(&mut shell);
        ctl.on_close_requested(&mut shell);
        assert_eq!(shell.count("notify"), 1);
    }

    #[test]
    fn tray_show_recreates_missing_window() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctl = WindowLifecycleController::new(td.path());
        let mut shell = FakeShell::default();
        ctl.on_tray_show(&mut shell);
        ctl.on_tray_show(&mut shell);
        assert_eq!(shell.calls, vec!["create", "show"]);
    }

    #[test]
    fn reactivate_only_when_no_window_is_open() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctl = WindowLifecycleController::new(td.path());
        let mut shell = FakeShell::default();
        ctl.on_reactivate(&mut shell, 1);
        assert!(shell.calls.is_empty());
        ctl.on_reactivate(&mut shell, 0);
        assert_eq!(shell.calls, vec!["create"]);
    }

    #[test]
    fn quit_is_terminal_and_close_is_allowed() {
        let td = tempfile::tempdir().expect("tempdir");
        let mut ctl = WindowLifecycleController::new(td.path());
        let mut shell = FakeShell::with_window();

        ctl.on_tray_exit(&mut shell);
        ctl.request_quit(&mut shell);
        assert_eq!(ctl.state(), Lifecycle::Quitting);
        assert_eq!(shell.calls, vec!["remove_tray", "exit"]);

        assert_eq!(ctl.on_close_requested(&mut shell), CloseDecision::Allow);
        ctl.on_tray_show(&mut shell);
        ctl.on_reactivate(&mut shell, 0);
        assert_eq!(ctl.state(), Lifecycle::Quitting);
        assert_eq!(shell.calls, vec!["remove_tray", "exit"]);
    }

    #[cfg(unix)]
    #[test]
    fn exit_terminates_worker_exactly_once() {
        let td = tempfile::tempdir().expect("tempdir");
        let kill = Arc::new(CountingKill(AtomicUsize::new(0)));
        let sup = ProcessSupervisor::new(
            td.path(),
            std::path::PathBuf::from("/bin/sh"),
            RunContext::Production,
        )
        .with_strategy(kill.clone());
        sup.spawn().expect("spawn");

        let mut ctl = WindowLifecycleController::new(td.path());
        let mut shell = FakeShell::with_window();
        ctl.on_tray_exit(&mut shell);
        ctl.on_exit(&sup);
        ctl.on_exit(&sup);
        assert_eq!(kill.0.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.state(), Lifecycle::Quitting);
    }

    #[test]
    fn exit_in_development_never_signals() {
        let td = tempfile::tempdir().expect("tempdir");
        let kill = Arc::new(CountingKill(AtomicUsize::new(0)));
        let sup = ProcessSupervisor::new(td.path(), td.path().join("w"), RunContext::Development)
            .with_strategy(kill.clone());
        sup.spawn().expect("spawn");
        let mut ctl = WindowLifecycleController::new(td.path());
        ctl.on_exit(&sup);
        assert_eq!(kill.0.load(Ordering::SeqCst), 0);
    }
}
