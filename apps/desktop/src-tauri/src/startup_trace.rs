use std::{fs::OpenOptions, io::Write};

use petlink_observability::{data_dir, trace};

// Plain-text startup breadcrumbs for crashes that happen before the trace sink is usable.
pub fn mark_best_effort(stage: &str) {
    let ts_ms = trace::now_ms();
    let Ok(dir) = data_dir::data_dir() else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let Ok(mut f) = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("startup_trace.log"))
    else {
        return;
    };
    let _ = writeln!(f, "ts_ms={ts_ms} stage={stage}");
}
