pub mod mcp_client;

use std::io::Write as _;

/// Return the platform-standard data directory for MCP Conduit.
///
/// - macOS: `~/Library/Application Support/mcp-conduit/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-conduit\`
/// - Linux: `$XDG_DATA_HOME/mcp-conduit/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-conduit/` only if none of the above can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-conduit");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-conduit")
}

/// Initialize the tracing subscriber.
///
/// With `log_to_file`:
/// rotates the previous `conduit.log` generations, opens a fresh log whose
/// writer flushes every record, and logs a startup line naming the file.
///
/// Otherwise logs go to stderr, keeping stdout free for command output. If
/// the log file cannot be opened, stderr is used instead.
pub fn init_tracing(log_to_file: bool) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_conduit=info,warn"));

    let log_file = if log_to_file { open_log_file() } else { None };

    match log_file {
        Some((log_path, file)) => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(LogFileWriter::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .try_init();

            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                log_file = %log_path.display(),
                pid = std::process::id(),
                "=== MCP Conduit starting ==="
            );
        }
        None => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .try_init();
        }
    }
}

/// Number of rotated `conduit.log.N` generations kept beside the live log.
const LOG_GENERATIONS: u32 = 3;

/// Rotate and open `conduit.log` under the data directory.
///
/// Every failure is reported on stderr. A failed rotation still opens the
/// log (appending to the old one); a failed open returns `None`.
fn open_log_file() -> Option<(std::path::PathBuf, std::fs::File)> {
    let log_dir = data_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("cannot create log directory {}: {e}", log_dir.display());
        return None;
    }

    let log_path = log_dir.join("conduit.log");
    if let Err(e) = rotate_log_file(&log_path, LOG_GENERATIONS) {
        eprintln!("cannot rotate {}: {e}", log_path.display());
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => Some((log_path, file)),
        Err(e) => {
            eprintln!("cannot open {}: {e}", log_path.display());
            None
        }
    }
}

fn generation_path(base: &std::path::Path, n: u32) -> std::path::PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    std::path::PathBuf::from(name)
}

/// Shift `base` to `base.1`, `base.1` to `base.2` and so on up to `keep`.
///
/// Gaps in the chain are fine. The first rename or delete that fails for a
/// reason other than a missing file aborts the rotation.
fn rotate_log_file(base: &std::path::Path, keep: u32) -> std::io::Result<()> {
    fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    if keep == 0 {
        return ignore_missing(std::fs::remove_file(base));
    }

    ignore_missing(std::fs::remove_file(generation_path(base, keep)))?;
    for n in (1..keep).rev() {
        ignore_missing(std::fs::rename(
            generation_path(base, n),
            generation_path(base, n + 1),
        ))?;
    }
    ignore_missing(std::fs::rename(base, generation_path(base, 1)))
}

/// Shared log file handle that pushes every record to disk immediately.
///
/// A crashing child server can take the whole process group down; records
/// must already be on disk when that happens. A poisoned lock is recovered.
#[derive(Clone)]
struct LogFileWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl LogFileWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }

    fn file(&self) -> std::sync::MutexGuard<'_, std::fs::File> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::io::Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.file();
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file().flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_keeps_last_three() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("conduit.log");

        for generation in 0..5 {
            std::fs::write(&base, format!("run {generation}")).unwrap();
            rotate_log_file(&base, LOG_GENERATIONS).unwrap();
        }

        assert!(!base.exists());
        let read = |n: u32| std::fs::read_to_string(generation_path(&base, n)).unwrap();
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!generation_path(&base, 4).exists());
    }

    #[test]
    fn test_rotate_without_existing_log_is_ok() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("conduit.log");
        rotate_log_file(&base, LOG_GENERATIONS).unwrap();
        assert!(!generation_path(&base, 1).exists());
    }

    #[test]
    fn test_rotate_reports_blocked_rename() {
        let tmp = tempfile::TempDir::new().unwrap();
        let base = tmp.path().join("conduit.log");
        std::fs::write(&base, "live").unwrap();
        // A non-empty directory cannot be replaced by a file rename.
        std::fs::create_dir(generation_path(&base, 1)).unwrap();
        std::fs::write(generation_path(&base, 1).join("keep"), "x").unwrap();

        assert!(rotate_log_file(&base, 1).is_err());
        assert_eq!(std::fs::read_to_string(&base).unwrap(), "live");
    }

    #[test]
    fn test_log_file_writer_writes_through() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = LogFileWriter::new(file);
        writer.write_all(b"hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
    }

    #[test]
    fn test_log_file_writer_survives_poisoned_lock() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let writer = LogFileWriter::new(std::fs::File::create(&path).unwrap());

        let shared = writer.file.clone();
        let _ = std::thread::spawn(move || {
            let _guard = shared.lock().unwrap();
            panic!("poison the log lock");
        })
        .join();
        assert!(writer.file.is_poisoned());

        let mut writer = writer;
        writer.write_all(b"after\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn test_data_dir_is_named_for_the_app() {
        let dir = data_dir();
        let name = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("mcp-conduit"));
    }
}
