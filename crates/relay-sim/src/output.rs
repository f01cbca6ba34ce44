use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

/// Run file opened by `--output-dir`. Every record emitted also lands here.
static RUN_FILE: OnceLock<Mutex<File>> = OnceLock::new();

/// Create `<dir>/relay-sim-<mode>-<local time>.jsonl` and route records to it.
pub fn open_run_file(dir: &Path, mode: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S%.3f");
    let path = dir.join(format!("relay-sim-{mode}-{stamp}.jsonl"));
    let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
    RUN_FILE
        .set(Mutex::new(file))
        .map_err(|_| io::Error::other("run file already open"))?;
    Ok(path)
}

/// One JSON record per line on stdout, mirrored to the run file.
pub fn emit<T: Serialize>(record: &T) {
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!("record not serializable: {e}");
            return;
        }
    };
    println!("{line}");

    if let Some(file) = RUN_FILE.get() {
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            tracing::warn!("run file write failed: {e}");
        }
    }
}
