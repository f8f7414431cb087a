use crate::Config;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

pub const LOG_FILE_NAME: &str = "fleet-hub.log";

/// Installs the global subscriber. `RUST_LOG` wins over everything else.
pub fn init_logging(config: &Config) {
    let directive = level_directive(config.debug, std::env::var("FLEET_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let log = match HubLog::open(&config.log_dir, true) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            HubLog::stdout_only()
        }
    };
    let path = log.path().map(|path| path.display().to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        if let Some(path) = path {
            tracing::debug!(event = "log_file_opened", path = %path);
        }
    }
}

fn level_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    match env_level {
        Some(level) if !level.trim().is_empty() => level.trim().to_string(),
        _ => "info".to_string(),
    }
}

/// Destination of hub log lines: stdout, `<log_dir>/fleet-hub.log`, or both.
pub struct HubLog {
    stdout: bool,
    file: Option<Mutex<File>>,
    path: Option<PathBuf>,
}

impl HubLog {
    pub fn stdout_only() -> Self {
        Self {
            stdout: true,
            file: None,
            path: None,
        }
    }

    /// An empty `log_dir` means no file.
    pub fn open(log_dir: &str, stdout: bool) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self {
                stdout,
                file: None,
                path: None,
            });
        }
        let dir = PathBuf::from(log_dir.trim());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            stdout,
            file: Some(Mutex::new(file)),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl<'a> MakeWriter<'a> for HubLog {
    type Writer = HubLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        HubLogWriter {
            stdout: self.stdout.then(io::stdout),
            file: self.file.as_ref(),
        }
    }
}

/// One formatted event on its way out. A failing sink never fails the event.
pub struct HubLogWriter<'a> {
    stdout: Option<io::Stdout>,
    file: Option<&'a Mutex<File>>,
}

impl Write for HubLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stdout) = self.stdout.as_mut() {
            let _ = stdout.write_all(buf);
        }
        if let Some(Ok(mut file)) = self.file.map(Mutex::lock) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stdout) = self.stdout.as_mut() {
            let _ = stdout.flush();
        }
        if let Some(Ok(mut file)) = self.file.map(Mutex::lock) {
            let _ = file.flush();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_beats_level_env() {
        assert_eq!(level_directive(true, Some("warn".to_string())), "debug");
        assert_eq!(level_directive(false, Some(" warn ".to_string())), "warn");
        assert_eq!(level_directive(false, Some("  ".to_string())), "info");
        assert_eq!(level_directive(false, None), "info");
    }

    #[test]
    fn events_append_to_the_hub_log_file() {
        let dir = std::env::temp_dir().join(format!("fleet-hub-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let dir_str = dir.to_string_lossy().to_string();

        let log = HubLog::open(&dir_str, false).expect("open");
        assert_eq!(log.path(), Some(dir.join(LOG_FILE_NAME).as_path()));
        log.make_writer().write_all(b"first\n").expect("write");
        drop(log);

        let log = HubLog::open(&dir_str, false).expect("reopen");
        let mut writer = log.make_writer();
        writer.write_all(b"second\n").expect("write");
        writer.flush().expect("flush");

        let contents = std::fs::read_to_string(dir.join(LOG_FILE_NAME)).expect("read");
        assert_eq!(contents, "first\nsecond\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn blank_log_dir_opens_no_file() {
        let log = HubLog::open("  ", false).expect("open");
        assert!(log.path().is_none());
        assert_eq!(log.make_writer().write(b"dropped").expect("write"), 7);
    }
}
