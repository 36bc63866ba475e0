//! Game process lifecycle supervisor.
//!
//! Owns the external server process and its state machine. Transitions are
//! serialized under one lock (start, stop, and exit detection never
//! interleave); output capture and broadcasting run concurrently with it.
//! The state machine is `Stopped -> Starting -> Running -> Stopping ->
//! Stopped`, with `Running -> Stopped` taken directly when the process
//! exits out from under us.

use crate::broadcast::LogBroadcaster;
use gsc_core::{GscError, GscResult, LogSource, ServerState};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Supervisor tuning taken from the server config.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Default launch path used when a start request carries none.
    pub launch_path: Option<String>,
    /// Working directory for the spawned process.
    pub working_dir: Option<PathBuf>,
    /// Line written to the process input for a graceful shutdown.
    pub shutdown_command: String,
    /// How long to wait for a graceful exit before force-terminating.
    pub grace_period: Duration,
}

struct ProcessSlot {
    state: ServerState,
    /// Child handle. Taken by whichever of stop() / the exit monitor gets
    /// there first; the loser finds the slot empty and backs off.
    child: Option<Child>,
    /// Exclusive write end of the process input.
    stdin: Option<ChildStdin>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    broadcaster: Arc<LogBroadcaster>,
    slot: Mutex<ProcessSlot>,
    state_tx: watch::Sender<ServerState>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, broadcaster: Arc<LogBroadcaster>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ServerState::Stopped);
        Arc::new(Self {
            config,
            broadcaster,
            slot: Mutex::new(ProcessSlot {
                state: ServerState::Stopped,
                child: None,
                stdin: None,
            }),
            state_tx,
        })
    }

    /// Non-blocking snapshot of the current state.
    pub fn state(&self) -> ServerState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn watch(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// Spawn the game server process at `path` (or the configured default).
    ///
    /// Valid only while Stopped. On spawn failure the state reverts to
    /// Stopped and `SpawnFailure` is returned.
    pub async fn start(self: &Arc<Self>, path: Option<&str>) -> GscResult<()> {
        let mut slot = self.slot.lock().await;
        if slot.state != ServerState::Stopped {
            return Err(GscError::AlreadyRunning);
        }

        let launch = path
            .map(|s| s.to_string())
            .or_else(|| self.config.launch_path.clone())
            .ok_or_else(|| GscError::Other("no launch path configured".into()))?;

        self.transition(&mut slot, ServerState::Starting);

        let mut command = Command::new(&launch);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.transition(&mut slot, ServerState::Stopped);
                warn!(path = %launch, error = %e, "spawn failed");
                return Err(GscError::SpawnFailure(e.to_string()));
            }
        };

        let pid = child.id();
        // One fresh exit signal per process life; the read loops trip it at
        // end-of-stream and the monitor turns it into a state transition.
        let exited = Arc::new(Notify::new());

        if let Some(stdout) = child.stdout.take() {
            let broadcaster = self.broadcaster.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    broadcaster.publish(LogSource::Stdout, line);
                }
                debug!("stdout reader finished");
                exited.notify_one();
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let broadcaster = self.broadcaster.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    broadcaster.publish(LogSource::Stderr, line);
                }
                debug!("stderr reader finished");
                exited.notify_one();
            });
        }

        slot.stdin = child.stdin.take();
        slot.child = Some(child);
        self.transition(&mut slot, ServerState::Running);
        drop(slot);

        let supervisor = self.clone();
        tokio::spawn(async move {
            exited.notified().await;
            supervisor.handle_stream_eof().await;
        });

        info!(path = %launch, pid, "server process started");
        self.broadcaster.publish(
            LogSource::System,
            match pid {
                Some(pid) => format!("server process started (pid {pid})"),
                None => "server process started".to_string(),
            },
        );
        Ok(())
    }

    /// Stop the game server process.
    ///
    /// Valid only while Starting or Running. Writes the shutdown command to
    /// the process input, waits out the grace period, and force-terminates
    /// if the process is still alive. Idempotent against a concurrently
    /// detected unexpected exit: whichever observer reaps the child first
    /// wins, the other's transition is a no-op.
    pub async fn stop(&self) -> GscResult<()> {
        let (child, mut stdin) = {
            let mut slot = self.slot.lock().await;
            if !slot.state.is_active() {
                return Err(GscError::NotRunning);
            }
            self.transition(&mut slot, ServerState::Stopping);
            (slot.child.take(), slot.stdin.take())
        };

        if let Some(stdin) = stdin.as_mut() {
            // Graceful shutdown line; a write failure just means the
            // process already lost its input, so fall through to the kill.
            let line = format!("{}\n", self.config.shutdown_command);
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => {
                    let _ = stdin.flush().await;
                }
                Err(e) => debug!(error = %e, "shutdown command write failed"),
            }
        }

        if let Some(mut child) = child {
            match tokio::time::timeout(self.config.grace_period, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "server process exited"),
                Ok(Err(e)) => warn!(error = %e, "wait on server process failed"),
                Err(_) => {
                    warn!(
                        grace_secs = self.config.grace_period.as_secs(),
                        "grace period expired, force-terminating"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "kill failed");
                    }
                }
            }
        }

        let mut slot = self.slot.lock().await;
        if slot.state == ServerState::Stopping {
            slot.stdin = None;
            self.transition(&mut slot, ServerState::Stopped);
            drop(slot);
            self.broadcaster
                .publish(LogSource::System, "server stopped");
        }
        Ok(())
    }

    /// Write one command line to the process input.
    ///
    /// Valid only while Running; `IoFailure` if the input stream is already
    /// gone (a race with process exit).
    pub async fn send_command(&self, text: &str) -> GscResult<()> {
        let mut slot = self.slot.lock().await;
        if slot.state != ServerState::Running {
            return Err(GscError::NotRunning);
        }
        let stdin = slot
            .stdin
            .as_mut()
            .ok_or_else(|| GscError::IoFailure("input stream closed".into()))?;
        stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .map_err(|e| GscError::IoFailure(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| GscError::IoFailure(e.to_string()))?;
        Ok(())
    }

    /// Called once a read loop hits end-of-stream. If no orderly stop owns
    /// the child, this is an unexpected exit: reap it, drive the state to
    /// Stopped directly, and announce the crash.
    async fn handle_stream_eof(&self) {
        let child = {
            let mut slot = self.slot.lock().await;
            if !slot.state.is_active() {
                // stop() owns the shutdown (or it already completed).
                return;
            }
            slot.child.take()
        };
        let Some(mut child) = child else { return };

        let status = child.wait().await;
        let mut slot = self.slot.lock().await;
        if slot.state == ServerState::Stopped {
            return;
        }
        slot.stdin = None;
        self.transition(&mut slot, ServerState::Stopped);
        drop(slot);

        let announcement = match status {
            Ok(status) => format!("server process exited unexpectedly ({status})"),
            Err(_) => "server process exited unexpectedly".to_string(),
        };
        warn!("{announcement}");
        self.broadcaster.publish(LogSource::System, announcement);
    }

    fn transition(&self, slot: &mut ProcessSlot, next: ServerState) {
        debug!(from = %slot.state, to = %next, "state transition");
        slot.state = next;
        self.state_tx.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_supervisor(broadcaster: &Arc<LogBroadcaster>) -> Arc<Supervisor> {
        Supervisor::new(
            SupervisorConfig {
                launch_path: None,
                working_dir: None,
                shutdown_command: "stop".to_string(),
                grace_period: Duration::from_millis(200),
            },
            broadcaster.clone(),
        )
    }

    #[tokio::test]
    async fn start_rejects_when_already_running() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);

        // cat keeps running until its stdin closes.
        supervisor.start(Some("/bin/cat")).await.unwrap();
        assert_eq!(supervisor.state(), ServerState::Running);

        assert!(matches!(
            supervisor.start(Some("/bin/cat")).await,
            Err(GscError::AlreadyRunning)
        ));

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_rejects_when_stopped() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);
        assert!(matches!(supervisor.stop().await, Err(GscError::NotRunning)));
    }

    #[tokio::test]
    async fn spawn_failure_reverts_to_stopped() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);

        let result = supervisor.start(Some("/nonexistent/game-server")).await;
        assert!(matches!(result, Err(GscError::SpawnFailure(_))));
        assert_eq!(supervisor.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn start_without_path_or_config_fails() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);
        assert!(matches!(
            supervisor.start(None).await,
            Err(GscError::Other(_))
        ));
        assert_eq!(supervisor.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn unexpected_exit_drives_stopped_and_fails_commands() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);
        let sub = broadcaster.subscribe();

        // /bin/true exits immediately: an unexpected exit from our side.
        supervisor.start(Some("/bin/true")).await.unwrap();

        let mut rx = supervisor.watch();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == ServerState::Stopped),
        )
        .await
        .expect("exit not detected")
        .unwrap();

        assert!(matches!(
            supervisor.send_command("help").await,
            Err(GscError::NotRunning)
        ));

        // The crash announcement is a System line after the start notice.
        let mut saw_crash = false;
        while let Ok(Some(line)) = timeout(Duration::from_secs(1), sub.recv()).await {
            if line.source == LogSource::System && line.text.contains("unexpectedly") {
                saw_crash = true;
                break;
            }
        }
        assert!(saw_crash);
    }

    #[tokio::test]
    async fn command_output_reaches_subscribers() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);
        let sub = broadcaster.subscribe();

        supervisor.start(Some("/bin/cat")).await.unwrap();
        supervisor.send_command("hello world").await.unwrap();

        // cat echoes the command line back on stdout.
        let mut echoed = false;
        while let Ok(Some(line)) = timeout(Duration::from_secs(5), sub.recv()).await {
            if line.source == LogSource::Stdout && line.text == "hello world" {
                echoed = true;
                break;
            }
        }
        assert!(echoed);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_falls_back_to_kill() {
        let broadcaster = LogBroadcaster::new(100, 256);
        let supervisor = test_supervisor(&broadcaster);

        // cat only exits on stdin EOF, so the shutdown line is merely
        // echoed and the grace period has to expire.
        supervisor.start(Some("/bin/cat")).await.unwrap();
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), ServerState::Stopped);

        // A second stop is a plain state error, not a double-kill.
        assert!(matches!(supervisor.stop().await, Err(GscError::NotRunning)));
    }
}
