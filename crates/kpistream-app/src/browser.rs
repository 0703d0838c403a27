//! Opens dashboard links with the platform's default handler.

use std::process::{Command, Stdio};

use kpistream_core::error::CoreError;
use kpistream_core::ports::link_opener::LinkOpener;
use tracing::debug;

pub struct SystemBrowser;

impl SystemBrowser {
    fn command(link: &str) -> Command {
        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("open");
            cmd.arg(link);
            cmd
        } else if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", "start", "", link]);
            cmd
        } else {
            let mut cmd = Command::new("xdg-open");
            cmd.arg(link);
            cmd
        }
    }
}

impl LinkOpener for SystemBrowser {
    fn open(&self, link: &str) -> Result<(), CoreError> {
        debug!("opening {link}");
        // detached; the child's exit status is not awaited
        Self::command(link)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| CoreError::Internal(format!("failed to launch browser: {e}")))
    }
}
