mod shell;
mod startup_trace;

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use petlink_engine::{companion, CompanionHandle, CompanionView, MessageChannel, UiCommand};
use petlink_engine::{CloseDecision, WindowLifecycleController};
use petlink_observability::{data_dir, panic_log, safe_eprintln, Span};
use petlink_platform::{config, ProcessSupervisor, RunContext};
use shell::{TauriShell, MAIN_WINDOW, TRAY_ID};
use tauri::{
    menu::{Menu, MenuItem},
    tray::TrayIconBuilder,
    AppHandle, Emitter, Manager, RunEvent, State, WindowEvent,
};

const VIEW_EVENT: &str = "petlink_view";
const MENU_SHOW: &str = "show";
const MENU_EXIT: &str = "exit";

struct AppState {
    data_dir: PathBuf,
    supervisor: ProcessSupervisor,
    companion: CompanionHandle,
    lifecycle: Mutex<WindowLifecycleController>,
}

impl AppState {
    fn lifecycle(&self) -> MutexGuard<'_, WindowLifecycleController> {
        self.lifecycle.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn with_lifecycle<T>(
    app: &AppHandle,
    f: impl FnOnce(&mut WindowLifecycleController, &mut TauriShell<'_>) -> T,
) -> Option<T> {
    let state = app.try_state::<AppState>()?;
    let mut ctl = state.lifecycle();
    let mut shell = TauriShell::new(app);
    Some(f(&mut ctl, &mut shell))
}

fn cmd_span(data_dir: &Path, step_id: &str, ctx: Option<serde_json::Value>) -> Span {
    Span::start(data_dir, None, "Cmd", step_id, ctx)
}

fn submit(
    state: &AppState,
    step_id: &str,
    ctx: Option<serde_json::Value>,
    cmd: UiCommand,
) -> Result<(), String> {
    let span = cmd_span(&state.data_dir, step_id, ctx);
    if state.companion.submit(cmd) {
        span.ok(None);
        Ok(())
    } else {
        span.err("internal", "E_COMPANION_STOPPED", "control loop is not running", None);
        Err("E_COMPANION_STOPPED: control loop is not running".to_string())
    }
}

#[tauri::command]
fn ble_scan(state: State<'_, AppState>) -> Result<(), String> {
    submit(&state, "CMD.ble_scan", None, UiCommand::Scan)
}

#[tauri::command]
fn ble_connect(state: State<'_, AppState>, address: String) -> Result<(), String> {
    let address = address.trim().to_string();
    if address.is_empty() {
        return Err("E_BAD_ADDRESS: address is empty".to_string());
    }
    submit(
        &state,
        "CMD.ble_connect",
        Some(serde_json::json!({"address": address})),
        UiCommand::Connect { address },
    )
}

#[tauri::command]
fn ble_disconnect(state: State<'_, AppState>) -> Result<(), String> {
    submit(&state, "CMD.ble_disconnect", None, UiCommand::Disconnect)
}

#[tauri::command]
fn ble_status(state: State<'_, AppState>) -> Result<(), String> {
    submit(&state, "CMD.ble_status", None, UiCommand::RequestStatus)
}

#[tauri::command]
fn companion_view(state: State<'_, AppState>) -> CompanionView {
    state.companion.view()
}

#[tauri::command]
fn app_quit(app: AppHandle) {
    with_lifecycle(&app, |ctl, shell| ctl.request_quit(shell));
}

fn build_tray(app: &tauri::App) -> tauri::Result<()> {
    let show = MenuItem::with_id(app, MENU_SHOW, "Show PetLink", true, None::<&str>)?;
    let exit = MenuItem::with_id(app, MENU_EXIT, "Exit", true, None::<&str>)?;
    let menu = Menu::with_items(app, &[&show, &exit])?;

    let mut tray = TrayIconBuilder::with_id(TRAY_ID)
        .tooltip("PetLink")
        .menu(&menu)
        .on_menu_event(|app, event| match event.id.as_ref() {
            MENU_SHOW => {
                with_lifecycle(app, |ctl, shell| ctl.on_tray_show(shell));
            }
            MENU_EXIT => {
                with_lifecycle(app, |ctl, shell| ctl.on_tray_exit(shell));
            }
            _ => {}
        });
    if let Some(icon) = app.default_window_icon() {
        tray = tray.icon(icon.clone());
    }
    tray.build(app)?;
    Ok(())
}

fn forward_views(app: &AppHandle, companion: &CompanionHandle) {
    let app = app.clone();
    let mut views = companion.subscribe();
    tauri::async_runtime::spawn(async move {
        while views.changed().await.is_ok() {
            let view = views.borrow_and_update().clone();
            let _ = app.emit(VIEW_EVENT, view);
        }
    });
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    startup_trace::mark_best_effort("run_enter");
    panic_log::install_best_effort();
    let ctx = tauri::generate_context!();
    startup_trace::mark_best_effort("context_generated");

    let built = tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, _argv, _cwd| {
            // A second launch surfaces the running instance.
            with_lifecycle(app, |ctl, shell| ctl.on_tray_show(shell));
        }))
        .plugin(tauri_plugin_notification::init())
        .setup(|app| {
            startup_trace::mark_best_effort("setup_enter");
            let dir = data_dir::data_dir()?;
            let cfg = config::load_config_or_recover(&dir).with_env_overrides();
            let context = RunContext::resolve(tauri::is_dev());
            let resource_dir = app.path().resource_dir()?;

            let supervisor = ProcessSupervisor::new(
                &dir,
                config::resolve_worker_path(&resource_dir, &cfg),
                context,
            );
            supervisor.spawn_best_effort();

            let channel = MessageChannel::new(&dir, cfg.reconnect_delay());
            let companion = tauri::async_runtime::block_on(async {
                companion::start(&channel, &cfg.channel_url, &dir)
            });
            forward_views(app.handle(), &companion);

            app.manage(AppState {
                lifecycle: Mutex::new(WindowLifecycleController::new(&dir)),
                data_dir: dir,
                supervisor,
                companion,
            });
            build_tray(app)?;

            startup_trace::mark_best_effort("setup_exit");
            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::CloseRequested { api, .. } = event {
                if window.label() != MAIN_WINDOW {
                    return;
                }
                let decision =
                    with_lifecycle(window.app_handle(), |ctl, shell| ctl.on_close_requested(shell));
                if decision == Some(CloseDecision::Hide) {
                    api.prevent_close();
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            ble_scan,
            ble_connect,
            ble_disconnect,
            ble_status,
            companion_view,
            app_quit
        ])
        .build(ctx);

    let app = match built {
        Ok(app) => app,
        Err(e) => {
            safe_eprintln!("petlink: failed to start: {e}");
            startup_trace::mark_best_effort("build_failed");
            return;
        }
    };

    app.run(|app, event| match event {
        RunEvent::Exit => {
            if let Some(state) = app.try_state::<AppState>() {
                state.lifecycle().on_exit(&state.supervisor);
            }
        }
        #[cfg(target_os = "macos")]
        RunEvent::Reopen { .. } => {
            let open = app.webview_windows().len();
            with_lifecycle(app, |ctl, shell| ctl.on_reactivate(shell, open));
        }
        _ => {}
    });
}
