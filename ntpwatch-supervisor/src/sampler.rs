/**
 * SAMPLER PROCESS - Owns the external sampling process of one server identity
 *
 * ROLE: spawn the sampler, forward each stdout line to the output sink,
 * respawn it every time it exits, kill it when asked to stop.
 *
 * LOOP (one iteration):
 * - stop requested (shutdown or deregistration)  -> kill child, forward its leftover output, Stopped
 * - no child                                     -> spawn (Starting / Restarting -> Running)
 * - child exited                                 -> forward its leftover output, then
 *                                                   still registered ? respawn : quit quietly
 * - otherwise                                    -> read one line, bounded by the poll interval
 *
 * Restarts are immediate and unconditional: no backoff, no exit-code inspection.
 */

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SamplerCommand;
use crate::identity::ServerIdentity;
use crate::sink::SampleRecord;
use crate::state::{SamplerState, SamplerStatus, Shared};
use crate::supervisor::SupervisorContext;

/// Interval the local clock sampler always runs at, whatever the config says.
pub const LOCAL_INTERVAL_MS: u64 = 1000;
/// Target argument telling a sampler to read the local clock.
pub const LOCAL_TARGET: &str = "local";
/// Longest line forwarded as one row; longer output is split at this size.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Command line of the sampler for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SamplingSpec {
    /// `<program> [leading args] <target> <interval-ms> <run-duration-s>`
    pub fn for_identity(
        identity: &ServerIdentity,
        interval_ms: u64,
        run_duration_secs: u64,
        remote: &SamplerCommand,
        local: &SamplerCommand,
    ) -> Self {
        let (command, target, interval_ms) = if identity.is_local() {
            (local, LOCAL_TARGET.to_string(), LOCAL_INTERVAL_MS)
        } else {
            (remote, identity.address().to_string(), interval_ms)
        };

        let mut args = command.args.clone();
        args.extend([target, interval_ms.to_string(), run_duration_secs.to_string()]);
        Self { program: command.program.clone(), args }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Holds one unit of the context's live-child count until dropped.
struct LiveChild(Arc<SupervisorContext>);

impl LiveChild {
    fn count(ctx: &Arc<SupervisorContext>) -> Self {
        ctx.live_children.fetch_add(1, Ordering::Relaxed);
        Self(ctx.clone())
    }
}

impl Drop for LiveChild {
    fn drop(&mut self) {
        self.0.live_children.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Child process plus its stdout reader.
///
/// Dropping it (task aborted, child reaped) releases the live-child count;
/// `kill_on_drop` takes care of a child still running at that point.
struct RunningChild {
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Bytes of a line not terminated yet; survives poll timeouts.
    pending: Vec<u8>,
    _live: Option<LiveChild>,
}

enum ReadOutcome {
    Line(String),
    Idle,
    Eof,
}

impl RunningChild {
    fn new(child: Child, stdout: ChildStdout, live: Option<LiveChild>) -> Self {
        Self { child, stdout: BufReader::new(stdout), pending: Vec::new(), _live: live }
    }

    /// Reads at most one line, waiting no longer than `poll`.
    ///
    /// A line reaching [`MAX_LINE_BYTES`] without a newline is returned as is;
    /// so is a trailing partial line at end of output.
    async fn read_line(&mut self, poll: Duration) -> std::io::Result<ReadOutcome> {
        let room = MAX_LINE_BYTES.saturating_sub(self.pending.len()) as u64;
        let mut limited = (&mut self.stdout).take(room);
        match timeout(poll, limited.read_until(b'\n', &mut self.pending)).await {
            Err(_elapsed) => Ok(ReadOutcome::Idle),
            Ok(Ok(0)) if self.pending.is_empty() => Ok(ReadOutcome::Eof),
            Ok(Ok(_)) => {
                let line = decode_line(&self.pending);
                self.pending.clear();
                Ok(ReadOutcome::Line(line))
            }
            Ok(Err(e)) => Err(e),
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let mut line = String::from_utf8_lossy(bytes).into_owned();
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Supervision loop of one identity. Built by the reconciler, consumed by [`SamplerProcess::run`].
pub struct SamplerProcess {
    identity: ServerIdentity,
    spec: SamplingSpec,
    instance_id: Uuid,
    status: Shared<SamplerStatus>,
    stop: watch::Receiver<bool>,
    ctx: Arc<SupervisorContext>,
}

impl SamplerProcess {
    pub fn new(
        identity: ServerIdentity,
        spec: SamplingSpec,
        instance_id: Uuid,
        status: Shared<SamplerStatus>,
        stop: watch::Receiver<bool>,
        ctx: Arc<SupervisorContext>,
    ) -> Self {
        Self { identity, spec, instance_id, status, stop, ctx }
    }

    fn stop_requested(&self) -> bool {
        *self.ctx.shutdown.borrow() || *self.stop.borrow()
    }

    fn set_state(&self, state: SamplerState) {
        let mut status = self.status.lock();
        status.state = state;
        if matches!(state, SamplerState::Exited | SamplerState::Stopped) {
            status.pid = None;
        }
    }

    fn still_registered(&self) -> bool {
        self.ctx.supervised.lock().is_current(&self.identity, self.instance_id)
    }

    fn spawn_child(&self) -> std::io::Result<RunningChild> {
        let mut child = self.spec.command().spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("sampler stdout was not captured"))?;
        {
            let mut status = self.status.lock();
            status.state = SamplerState::Running;
            status.pid = child.id();
        }
        Ok(RunningChild::new(child, stdout, Some(LiveChild::count(&self.ctx))))
    }

    async fn terminate(&self, mut running: RunningChild) {
        self.set_state(SamplerState::Stopping);
        if let Err(e) = running.child.start_kill() {
            // Already exited between the last poll and now.
            debug!("kill of sampler for {} failed: {e}", self.identity);
        }
        if let Err(e) = running.child.wait().await {
            warn!("failed to reap sampler for {}: {e}", self.identity);
        }
        self.drain_output(&mut running).await;
    }

    /// Forwards what a finished child left in its pipe, up to end of output.
    async fn drain_output(&self, running: &mut RunningChild) {
        loop {
            match running.read_line(self.ctx.poll_interval).await {
                Ok(ReadOutcome::Line(line)) => self.forward(&line),
                Ok(ReadOutcome::Idle | ReadOutcome::Eof) => return,
                Err(e) => {
                    warn!("read error on sampler for {}: {e}", self.identity);
                    return;
                }
            }
        }
    }

    fn forward(&self, line: &str) {
        let record = SampleRecord { identity: &self.identity, raw: line };
        if let Err(e) = self.ctx.sink.write_record(&record) {
            error!("dropping sample from {}: {e}", self.identity);
        }
    }

    /// Waits one poll interval, returning early when a stop is requested.
    async fn pause(&mut self) {
        let mut shutdown = self.ctx.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.ctx.poll_interval) => {}
            _ = shutdown.changed() => {}
            _ = self.stop.changed() => {}
        }
    }

    pub async fn run(mut self) {
        let poll = self.ctx.poll_interval;
        let mut current: Option<RunningChild> = None;

        loop {
            if self.stop_requested() {
                if let Some(running) = current.take() {
                    self.terminate(running).await;
                }
                self.set_state(SamplerState::Stopped);
                debug!("sampler for {} stopped", self.identity);
                return;
            }

            let Some(running) = current.as_mut() else {
                match self.spawn_child() {
                    Ok(running) => current = Some(running),
                    Err(e) => {
                        warn!("can't start sampler {:?} for {}: {e}", self.spec.program, self.identity);
                        self.pause().await;
                    }
                }
                continue;
            };

            match running.child.try_wait() {
                Ok(Some(exit)) => {
                    self.drain_output(running).await;
                    current = None;
                    self.set_state(SamplerState::Exited);
                    debug!("sampler for {} exited ({exit})", self.identity);

                    if !self.still_registered() {
                        self.set_state(SamplerState::Stopped);
                        info!("sampler for {} no longer configured, not restarting", self.identity);
                        return;
                    }
                    {
                        let mut status = self.status.lock();
                        status.state = SamplerState::Restarting;
                        status.restarts += 1;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("can't poll sampler for {}: {e}", self.identity),
            }

            match running.read_line(poll).await {
                Ok(ReadOutcome::Line(line)) => self.forward(&line),
                Ok(ReadOutcome::Idle) => {}
                Ok(ReadOutcome::Eof) => {
                    // Output closed; give the child one poll interval to finish exiting.
                    let _ = timeout(poll, running.child.wait()).await;
                }
                Err(e) => {
                    warn!("read error on sampler for {}: {e}", self.identity);
                    let _ = timeout(poll, running.child.wait()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SamplerCommand {
        SamplerCommand::new("/usr/bin/ntpsampler")
    }

    fn local() -> SamplerCommand {
        SamplerCommand::new("/usr/bin/timesampler").with_args(["--stdout"])
    }

    #[test]
    fn test_remote_spec() {
        let identity = ServerIdentity::new("alpha", "10.0.0.5".parse().unwrap(), "alpha.example");
        let spec = SamplingSpec::for_identity(&identity, 5000, 3600, &remote(), &local());

        assert_eq!(spec.program, PathBuf::from("/usr/bin/ntpsampler"));
        assert_eq!(spec.args, vec!["10.0.0.5", "5000", "3600"]);
    }

    #[test]
    fn test_local_spec_ignores_configured_interval() {
        let spec = SamplingSpec::for_identity(&ServerIdentity::local(), 250, 3600, &remote(), &local());

        assert_eq!(spec.program, PathBuf::from("/usr/bin/timesampler"));
        assert_eq!(spec.args, vec!["--stdout", "local", "1000", "3600"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unterminated_output_is_split() {
        let spec = SamplingSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "head -c 20000 /dev/zero | tr '\\0' x".into()],
        };
        let mut child = spec.command().spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut running = RunningChild::new(child, stdout, None);

        let mut lines = Vec::new();
        loop {
            match running.read_line(Duration::from_secs(5)).await.unwrap() {
                ReadOutcome::Line(line) => lines.push(line),
                ReadOutcome::Idle => panic!("sampler output stalled"),
                ReadOutcome::Eof => break,
            }
        }
        running.child.wait().await.unwrap();

        assert!(lines.iter().all(|l| l.len() <= MAX_LINE_BYTES));
        assert_eq!(lines.iter().map(String::len).sum::<usize>(), 20000);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"offset 0.002\r\n"), "offset 0.002");
        assert_eq!(decode_line(b"tail"), "tail");
        assert_eq!(decode_line(&[0x66, 0xff, b'\n']), "f\u{fffd}");
    }
}
