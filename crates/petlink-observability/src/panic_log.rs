use std::{
    fs::OpenOptions,
    io::Write,
    time::{SystemTime, UNIX_EPOCH},
};

// The default hook prints to stderr, which can fail (and recurse) in GUI-subsystem
// builds. Panics go to `<data_dir>/panic.log` instead; the hook itself never panics.
pub fn install_best_effort() {
    std::panic::set_hook(Box::new(|info| {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let bt = std::backtrace::Backtrace::force_capture();
        let msg = format!("ts_ms={ts_ms}\npanic={info}\nbacktrace={bt}\n---\n");

        if let Ok(dir) = crate::data_dir::data_dir() {
            let _ = std::fs::create_dir_all(&dir);
            if let Ok(mut f) = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("panic.log"))
            {
                let _ = f.write_all(msg.as_bytes());
            }
        }
    }));
}
