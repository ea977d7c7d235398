//! `Multiplexer` implementation that shells out to tmux.

use std::{collections::BTreeMap, fmt::Write as _, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use command_group::AsyncCommandGroup;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};

use crate::{
    control::{ControlLine, parse_line},
    multiplexer::{BackingSession, CreateSpec, Multiplexer, MuxError, OutputPipe, PaneInfo, Probe},
    shell::resolve_executable_path,
};

/// Upper bound for one tmux invocation.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered output chunks per pipe before the reader applies backpressure.
const PIPE_CAPACITY: usize = 256;

/// tmux-backed multiplexer.
#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    binary: PathBuf,
    socket: Option<String>,
}

impl TmuxMultiplexer {
    /// Use the tmux binary at `binary` on the default server socket.
    #[must_use]
    pub const fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            socket: None,
        }
    }

    /// Find tmux on PATH.
    ///
    /// # Errors
    /// Returns `NotInstalled` if no tmux executable can be found.
    pub async fn locate() -> Result<Self, MuxError> {
        resolve_executable_path("tmux")
            .await
            .map(Self::new)
            .ok_or(MuxError::NotInstalled)
    }

    /// Talk to a named server socket (`tmux -L <name>`).
    #[must_use]
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(socket) = &self.socket {
            cmd.arg("-L").arg(socket);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a tmux command and return its stdout.
    async fn run(&self, args: &[String]) -> Result<String, MuxError> {
        tracing::trace!(command = %display_args(args), "tmux");
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(COMMAND_TIMEOUT, cmd.output())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tmux timed out"))??;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_session(&stderr) {
            Err(MuxError::NoSuchSession(target_of(args)))
        } else {
            Err(MuxError::Command {
                command: args.first().cloned().unwrap_or_default(),
                stderr,
            })
        }
    }
}

fn is_missing_session(stderr: &str) -> bool {
    ["can't find session", "no server running", "error connecting", "session not found"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn target_of(args: &[String]) -> String {
    args.iter()
        .position(|a| a == "-t")
        .and_then(|i| args.get(i + 1))
        .map(|t| t.trim_start_matches('=').trim_end_matches(':').to_string())
        .unwrap_or_default()
}

fn exact(name: &str) -> String {
    format!("={name}")
}

fn exact_pane(name: &str) -> String {
    format!("={name}:")
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn hex_keys(data: &[u8]) -> Vec<String> {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn list_sessions(&self) -> Result<Vec<BackingSession>, MuxError> {
        let out = match self
            .run(&args(["list-panes", "-a", "-F", "#{session_name}\t#{pane_dead}"]))
            .await
        {
            Ok(out) => out,
            // No server means no sessions.
            Err(MuxError::NoSuchSession(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut running: BTreeMap<String, bool> = BTreeMap::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let (name, dead) = line
                .split_once('\t')
                .ok_or_else(|| MuxError::Parse(line.to_string()))?;
            *running.entry(name.to_string()).or_default() |= dead.trim() != "1";
        }

        Ok(running
            .into_iter()
            .map(|(name, any_running)| BackingSession {
                name,
                probe: if any_running { Probe::Running } else { Probe::PaneDead },
            })
            .collect())
    }

    async fn probe(&self, name: &str) -> Result<Probe, MuxError> {
        match self
            .run(&args(["list-panes", "-s", "-t", &exact(name), "-F", "#{pane_dead}"]))
            .await
        {
            Ok(out) => {
                if out.lines().any(|l| l.trim() == "0") {
                    Ok(Probe::Running)
                } else {
                    Ok(Probe::PaneDead)
                }
            }
            Err(MuxError::NoSuchSession(_)) => Ok(Probe::Missing),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &CreateSpec) -> Result<PaneInfo, MuxError> {
        if self.probe(&spec.name).await? != Probe::Missing {
            return Err(MuxError::DuplicateSession(spec.name.clone()));
        }

        let mut cmd = args(["new-session", "-d", "-P", "-F", "#{pane_id}", "-s"]);
        cmd.push(spec.name.clone());
        cmd.push("-c".to_string());
        cmd.push(spec.working_dir.to_string_lossy().into_owned());
        for (key, value) in &spec.env {
            cmd.push("-e".to_string());
            cmd.push(format!("{key}={value}"));
        }
        if let Some(program) = &spec.command {
            cmd.extend(program.iter().cloned());
        }

        let pane_id = self.run(&cmd).await?.trim().to_string();
        if pane_id.is_empty() {
            return Err(MuxError::Parse("new-session printed no pane id".to_string()));
        }

        // Keep exited panes around so they show up as zombies instead of
        // vanishing with the session.
        if let Err(e) = self
            .run(&args(["set-option", "-w", "-t", &exact_pane(&spec.name), "remain-on-exit", "on"]))
            .await
        {
            tracing::warn!(session = %spec.name, "Failed to set remain-on-exit: {e}");
        }

        tracing::debug!(session = %spec.name, %pane_id, "Created tmux session");
        Ok(PaneInfo {
            session: spec.name.clone(),
            pane_id,
        })
    }

    async fn kill(&self, name: &str) -> Result<(), MuxError> {
        match self.run(&args(["kill-session", "-t", &exact(name)])).await {
            Ok(_) | Err(MuxError::NoSuchSession(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn send_keys(&self, name: &str, data: &[u8]) -> Result<(), MuxError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut cmd = args(["send-keys", "-t", &exact_pane(name), "-H"]);
        cmd.extend(hex_keys(data));
        self.run(&cmd).await.map(|_| ())
    }

    async fn open_pipe(&self, name: &str) -> Result<OutputPipe, MuxError> {
        if self.probe(name).await? == Probe::Missing {
            return Err(MuxError::NoSuchSession(name.to_string()));
        }

        let mut cmd = self.command();
        cmd.args(["-C", "attach-session", "-r", "-t", &exact(name)])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.group_spawn()?;

        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| MuxError::Parse("control client has no stdout".to_string()))?;
        // Control mode exits when stdin closes; hold it for the pipe's life.
        let stdin = child.inner().stdin.take();

        let (pipe, tx, mut stop) = OutputPipe::channel(PIPE_CAPACITY);
        let session = name.to_string();

        tokio::spawn(async move {
            let _stdin = stdin;
            let mut reader = BufReader::new(stdout);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    line = read_line(&mut reader) => match line {
                        Ok(Some(line)) => match parse_line(&line) {
                            ControlLine::Output { data, .. } => {
                                if tx.send(Bytes::from(data)).await.is_err() {
                                    break;
                                }
                            }
                            ControlLine::Exit(reason) => {
                                tracing::debug!(%session, ?reason, "Control client exited");
                                break;
                            }
                            ControlLine::Other => {}
                        },
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(%session, "Control client read failed: {e}");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = child.kill().await {
                tracing::debug!(%session, "Control client already gone: {e}");
            }
        });

        Ok(pipe)
    }
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(Some(line))
}

/// Render a command line for logs.
fn display_args(args: &[String]) -> String {
    let mut out = String::new();
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let quoted = shlex::try_quote(a).map_or_else(|_| a.clone(), |q| q.into_owned());
        let _ = write!(out, "{quoted}");
    }
    out
}
