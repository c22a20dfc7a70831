use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Result file, when `--output-dir` was given. Set once in main().
static RESULTS: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// `<dir>/mts-stress_<scenario>_<YYYYMMDD-HHMMSS>.jsonl`, never an existing file.
pub fn results_path(dir: &Path, scenario: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let base = format!("mts-stress_{scenario}_{stamp}");

    let mut path = dir.join(format!("{base}.jsonl"));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{base}_{n}.jsonl"));
        n += 1;
    }
    Ok(path)
}

pub fn open_results(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    RESULTS
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "result file already open"))
}

/// Append one JSONL line to the result file, if any.
pub fn write_line(line: &str) {
    if let Some(file) = RESULTS.get() {
        if let Ok(mut w) = file.lock() {
            let _ = writeln!(w, "{line}");
            let _ = w.flush();
        }
    }
}
