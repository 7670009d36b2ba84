//! The announcement file that tells modules where the session listens.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Shell dialect of the announcement file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShellSyntax {
    /// `export NAME=value`
    #[default]
    Sh,
    /// `setenv NAME value`
    Csh,
}

/// Connection details published for modules started alongside the server.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub host: String,
    pub port: u16,
    pub pid: u32,
    pub key: String,
}

impl Announcement {
    /// `<prefix>.<pid>`
    pub fn path(prefix: &Path, pid: u32) -> PathBuf {
        let mut path = prefix.as_os_str().to_owned();
        path.push(format!(".{pid}"));
        PathBuf::from(path)
    }

    pub fn render(&self, syntax: ShellSyntax) -> String {
        let session = format!("{}:{}", self.host, self.port);
        let vars = [
            ("DRMS_HOST", self.host.clone()),
            ("DRMS_PORT", self.port.to_string()),
            ("DRMS_PID", self.pid.to_string()),
            ("DRMS_SESSION", session),
            ("DRMS_SESSION_KEY", self.key.clone()),
        ];

        let mut out = String::new();
        for (name, value) in vars {
            let _ = match syntax {
                ShellSyntax::Sh => writeln!(out, "export {name}={value}"),
                ShellSyntax::Csh => writeln!(out, "setenv {name} {value}"),
            };
        }
        out
    }

    /// Writes the file readable by the owner only.
    pub fn write(&self, path: &Path, syntax: ShellSyntax) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(self.render(syntax).as_bytes())?;
        file.sync_all()
    }
}
