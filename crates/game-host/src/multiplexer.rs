//! GNU screen session tooling.
//!
//! The managed server runs inside a detached screen session with a reserved
//! name. Screen identifies sessions as `<pid>.<name>`, which is where the
//! probe gets its pid from; `-X stuff` is how console input gets injected.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{HostError, Result};
use crate::tools::{run_tool, Capture};

const SCREEN: &str = "screen";

#[derive(Debug, Clone)]
pub struct ScreenSession {
    name: String,
    timeout: Duration,
}

impl ScreenSession {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check that the screen binary can be executed at all.
    pub async fn check_available(timeout: Duration) -> Result<()> {
        // `screen -v` exits non-zero on several versions; spawning is the test.
        run_tool(SCREEN, ["-v"], None, Capture::Output, timeout).await?;
        Ok(())
    }

    /// Pid embedded in the session identifier, if the session exists.
    pub async fn find_pid(&self) -> Result<Option<u32>> {
        let out = run_tool(SCREEN, ["-ls"], None, Capture::Output, self.timeout).await?;
        Ok(parse_session_list(&out.stdout, &self.name))
    }

    /// Create the detached session wrapping the server executable.
    pub async fn create(&self, executable: &Path, args: &[String], cwd: &Path) -> Result<()> {
        let mut argv: Vec<String> = vec![
            "-dmS".into(),
            self.name.clone(),
            executable.to_string_lossy().into_owned(),
        ];
        argv.extend(args.iter().cloned());

        let out = run_tool(SCREEN, &argv, Some(cwd), Capture::Discard, self.timeout).await?;
        if !out.status.success() {
            return Err(HostError::Io(std::io::Error::other(format!(
                "screen -dmS {} exited with {}",
                self.name, out.status
            ))));
        }
        debug!(session = %self.name, "screen session created");
        Ok(())
    }

    /// Point the session's window log at `log_path` and turn logging on.
    pub async fn bind_log(&self, log_path: &Path) -> Result<()> {
        let log = log_path.to_string_lossy().into_owned();
        self.command(&["logfile", &log]).await?;
        // Without this screen buffers the log for up to 10 seconds.
        if let Err(e) = self.command(&["logfile", "flush", "1"]).await {
            warn!(session = %self.name, "could not set log flush interval: {}", e);
        }
        self.command(&["log", "on"]).await
    }

    /// Type `text` followed by a newline into window 0 of the session.
    pub async fn stuff(&self, text: &str) -> Result<()> {
        let line = format!("{}\n", escape_stuff(text));
        let target = self.target().await?;
        let out = run_tool(
            SCREEN,
            ["-S", target.as_str(), "-p", "0", "-X", "stuff", line.as_str()],
            None,
            Capture::Output,
            self.timeout,
        )
        .await?;
        if !out.status.success() {
            return Err(HostError::DeliveryFailure(format!(
                "screen stuff failed: {}",
                first_line(&out.stdout, &out.stderr)
            )));
        }
        Ok(())
    }

    /// Run a screen command (`-X`) against this session.
    async fn command(&self, args: &[&str]) -> Result<()> {
        let target = self.target().await?;
        let mut argv = vec!["-S", target.as_str(), "-X"];
        argv.extend_from_slice(args);
        let out = run_tool(SCREEN, &argv, None, Capture::Output, self.timeout).await?;
        if !out.status.success() {
            return Err(HostError::Io(std::io::Error::other(format!(
                "screen -X {} failed: {}",
                args.join(" "),
                first_line(&out.stdout, &out.stderr)
            ))));
        }
        Ok(())
    }

    /// `<pid>.<name>` when the session is listed, so a stale session with the
    /// same name cannot be addressed by accident.
    async fn target(&self) -> Result<String> {
        match self.find_pid().await? {
            Some(pid) => Ok(format!("{}.{}", pid, self.name)),
            None => Err(HostError::NotRunning),
        }
    }
}

/// screen reads `^X` as a control character and `\` as an escape in
/// `stuff` arguments; quote both so the text arrives verbatim.
pub fn escape_stuff(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '^') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn first_line(stdout: &str, stderr: &str) -> String {
    stderr
        .lines()
        .chain(stdout.lines())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}

/// Find `name` in `screen -ls` output and return the pid prefix.
///
/// Lines look like `\t12345.gameserver\t(Detached)`. Dead sessions are
/// skipped.
pub fn parse_session_list(output: &str, name: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        if line.contains("(Dead") {
            return None;
        }
        let ident = line.split_whitespace().next()?;
        let (pid, session) = ident.split_once('.')?;
        if session != name {
            return None;
        }
        pid.parse().ok()
    })
}
