use anyhow::{Context, Result};
use tauri::{AppHandle, Manager, WebviewUrl, WebviewWindowBuilder};
use tauri_plugin_notification::NotificationExt;

use petlink_engine::WindowShell;

pub const MAIN_WINDOW: &str = "main";
pub const TRAY_ID: &str = "petlink-tray";

pub struct TauriShell<'a> {
    app: &'a AppHandle,
}

impl<'a> TauriShell<'a> {
    pub fn new(app: &'a AppHandle) -> Self {
        Self { app }
    }
}

impl WindowShell for TauriShell<'_> {
    fn window_exists(&self) -> bool {
        self.app.get_webview_window(MAIN_WINDOW).is_some()
    }

    fn create_window(&mut self) -> Result<()> {
        WebviewWindowBuilder::new(self.app, MAIN_WINDOW, WebviewUrl::App("index.html".into()))
            .title("PetLink")
            .inner_size(420.0, 640.0)
            .build()
            .context("create main window failed")?;
        Ok(())
    }

    fn show_window(&mut self) -> Result<()> {
        let Some(w) = self.app.get_webview_window(MAIN_WINDOW) else {
            return self.create_window();
        };
        w.unminimize().context("unminimize failed")?;
        w.show().context("show failed")?;
        w.set_focus().context("focus failed")?;
        Ok(())
    }

    fn hide_window(&mut self) -> Result<()> {
        if let Some(w) = self.app.get_webview_window(MAIN_WINDOW) {
            w.hide().context("hide failed")?;
        }
        Ok(())
    }

    fn notify_background(&mut self) -> Result<()> {
        self.app
            .notification()
            .builder()
            .title("PetLink")
            .body("PetLink keeps running in the tray. Use the tray menu to exit.")
            .show()
            .context("background notification failed")?;
        Ok(())
    }

    fn remove_tray(&mut self) {
        let _ = self.app.remove_tray_by_id(TRAY_ID);
    }

    fn exit_app(&mut self) {
        self.app.exit(0);
    }
}
