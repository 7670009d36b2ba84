//! Log output that follows the session log unit.
//!
//! Until the log storage unit is allocated, and again after the exit
//! protocol detaches it, log lines go to stdout.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Name of the log file inside the log storage unit.
pub const LOG_FILE_NAME: &str = "drms_server.log";

/// Switchable log destination shared by the subscriber and the exit protocol.
#[derive(Clone, Default)]
pub struct SessionLog {
    file: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends later output to `dir/drms_server.log`.
    pub fn attach(&self, dir: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE_NAME))?;
        let previous = self.file.lock().replace(BufWriter::new(file));
        if let Some(mut previous) = previous {
            previous.flush()?;
        }
        Ok(())
    }

    /// Flushes the log file and returns output to the console.
    pub fn detach(&self) -> io::Result<()> {
        match self.file.lock().take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.file.lock().is_some()
    }
}

/// Writer handed out per event by [`SessionLog`].
pub struct SessionLogWriter {
    file: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl Write for SessionLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().as_mut() {
            Some(file) => file.write(buf),
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => io::stdout().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for SessionLog {
    type Writer = SessionLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SessionLogWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Installs the global subscriber writing through `log`.
///
/// `level` is an `EnvFilter` directive; invalid directives fall back to
/// `info`. Does nothing if a subscriber is already installed.
pub fn init(level: &str, log: &SessionLog) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log.clone())
                .with_ansi(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_detach() {
        let dir = tempfile::tempdir().unwrap();
        let log = SessionLog::new();
        assert!(!log.is_attached());

        log.attach(dir.path()).unwrap();
        assert!(log.is_attached());
        let mut writer = log.make_writer();
        writer.write_all(b"session started\n").unwrap();

        log.detach().unwrap();
        assert!(!log.is_attached());
        let contents = std::fs::read_to_string(dir.path().join(LOG_FILE_NAME)).unwrap();
        assert_eq!(contents, "session started\n");
    }

    #[test]
    fn test_detach_without_file_is_noop() {
        let log = SessionLog::new();
        log.detach().unwrap();
    }
}
