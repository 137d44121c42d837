use crate::gov::child::{restore_limits, set_limits, ChildSpec};
use crate::gov::logger::{LineSink, Logger};
use anyhow::Context as _;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{oneshot, Notify};

/// How a child ended. `error` is `None` for a clean exit (status 0).
#[derive(Debug)]
pub struct ChildExit {
    pub error: Option<String>,
}

pub struct RunningChild {
    pub pid: i32,
    /// Fires exactly once, when the reaper harvests this child.
    pub exit: oneshot::Receiver<ChildExit>,
}

/// Single process-wide component that owns child-exit collection. Services
/// never call waitpid themselves; they register a child here and get an exit
/// notification back. SIGCHLD wakes a reap pass over the registered pids; a
/// periodic sweep covers coalesced signals.
#[derive(Clone)]
pub struct Reaper {
    inner: Arc<Inner>,
}

struct Inner {
    waiters: Mutex<HashMap<i32, oneshot::Sender<ChildExit>>>,
    // Serializes spawns so a temporary rlimit change never leaks into a
    // sibling's fork/exec.
    start_lock: Mutex<()>,
    quit: Notify,
}

impl Reaper {
    pub fn new() -> Reaper {
        let inner = Arc::new(Inner {
            waiters: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
            quit: Notify::new(),
        });
        let run_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run(run_inner).await;
        });
        Reaper { inner }
    }

    /// Spawn the child described by `spec`, wire its stdout/stderr into the
    /// logger's line sinks, and register it for reaping.
    pub fn start(&self, spec: &ChildSpec, logger: &Arc<Logger>) -> anyhow::Result<RunningChild> {
        let mut cmd = spec.command();
        let mut child = {
            let _guard = self
                .inner
                .start_lock
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let saved = match set_limits(spec) {
                Ok(s) => s,
                Err(e) => {
                    log::error!("error setting service limits: {e:#}");
                    Vec::new()
                }
            };
            let r = cmd.spawn();
            if let Err(e) = restore_limits(saved) {
                log::error!("error restoring limits: {e:#}");
            }
            r.with_context(|| format!("failed to start {}", spec.path.display()))?
        };
        let pid = child.id() as i32;
        if let Some(out) = child.stdout.take() {
            spawn_pump(out, LineSink::new(Arc::clone(logger), "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            spawn_pump(err, LineSink::new(Arc::clone(logger), "stderr"));
        }
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(pid, tx);
        // The pid is harvested through waitpid; dropping the Child handle
        // neither kills nor reaps it.
        drop(child);
        Ok(RunningChild { pid, exit: rx })
    }

    /// Stop the signal loop and drain any already-exited children.
    pub fn shutdown(&self) {
        self.inner.quit.notify_one();
        reap(&self.inner);
    }
}

async fn run(inner: Arc<Inner>) {
    let mut sigchld = match signal(SignalKind::child()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("cannot listen for SIGCHLD: {e}");
            return;
        }
    };
    let mut sweep = tokio::time::interval(Duration::from_millis(500));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = sigchld.recv() => reap(&inner),
            _ = sweep.tick() => reap(&inner),
            _ = inner.quit.notified() => break,
        }
    }
}

fn reap(inner: &Inner) {
    let mut waiters = inner.waiters.lock().unwrap_or_else(|p| p.into_inner());
    let pids: Vec<i32> = waiters.keys().copied().collect();
    for pid in pids {
        let outcome = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => continue,
            Ok(WaitStatus::Exited(_, 0)) => None,
            Ok(WaitStatus::Exited(_, code)) => Some(format!("exit status {code}")),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(format!("terminated by signal {sig}")),
            Ok(_) => continue,
            Err(e) => Some(format!("wait failed: {e}")),
        };
        if let Some(tx) = waiters.remove(&pid) {
            let _ = tx.send(ChildExit { error: outcome });
        }
    }
}

fn spawn_pump<P: IntoRawFd>(pipe: P, mut sink: LineSink) {
    let raw = pipe.into_raw_fd();
    tokio::spawn(async move {
        match pump_setup(raw) {
            Ok(afd) => {
                if let Err(e) = pump(&afd, &mut sink).await {
                    log::debug!("log pump ended: {e:#}");
                }
            }
            Err(e) => log::error!("cannot watch capture pipe: {e:#}"),
        }
        // Drain whatever is buffered so child output is not lost on exit.
        sink.finish();
    });
}

fn pump_setup(raw: i32) -> anyhow::Result<AsyncFd<OwnedFd>> {
    set_nonblocking(raw)?;
    // SAFETY: we just took ownership via into_raw_fd.
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    Ok(AsyncFd::new(owned)?)
}

fn set_nonblocking(fd: i32) -> anyhow::Result<()> {
    // SAFETY: fd is a valid open pipe descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    anyhow::ensure!(flags >= 0, "fcntl(F_GETFL) failed");
    let r = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    anyhow::ensure!(r >= 0, "fcntl(F_SETFL) failed");
    Ok(())
}

async fn pump(afd: &AsyncFd<OwnedFd>, sink: &mut LineSink) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = read_from_asyncfd(afd, &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.push(&buf[..n]);
    }
}

async fn read_from_asyncfd(fd: &AsyncFd<OwnedFd>, buf: &mut [u8]) -> anyhow::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        let r = guard.try_io(|inner| {
            // SAFETY: fd is a valid pipe fd; buf is valid for writes.
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let errno = nix::errno::Errno::last();
                if errno == nix::errno::Errno::EAGAIN || errno == nix::errno::Errno::EWOULDBLOCK {
                    return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock));
                }
                return Err(std::io::Error::from_raw_os_error(errno as i32));
            }
            Ok(n as usize)
        });
        match r {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(anyhow::anyhow!("read failed: {e}")),
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gov::child::build_child_spec;
    use crate::gov::config::Config;
    use crate::gov::logger::LogSpec;
    use std::collections::BTreeMap;

    fn cfg(command: &str, log: LogSpec) -> Config {
        Config {
            file: "test.conf".to_string(),
            command: command.to_string(),
            name: String::new(),
            dir: String::new(),
            env: BTreeMap::new(),
            start: true,
            user: String::new(),
            group: String::new(),
            priority: 1000,
            max_open_files: None,
            inject_gomaxprocs: false,
            inherit_exec_owner: false,
            watchdog: None,
            watchdog_interval: 300,
            log,
            err: None,
        }
    }

    #[tokio::test]
    async fn clean_exit_is_reported_once() {
        let reaper = Reaper::new();
        let spec = build_child_spec(&cfg("true", LogSpec::None)).unwrap();
        let logger = Arc::new(Logger::new(&LogSpec::None, std::path::Path::new("/tmp")));
        let running = reaper.start(&spec, &logger).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), running.exit)
            .await
            .expect("no exit within 5s")
            .expect("exit channel dropped");
        assert!(exit.error.is_none(), "unexpected error: {:?}", exit.error);
        reaper.shutdown();
    }

    #[tokio::test]
    async fn nonzero_exit_carries_the_status() {
        let reaper = Reaper::new();
        let spec = build_child_spec(&cfg("false", LogSpec::None)).unwrap();
        let logger = Arc::new(Logger::new(&LogSpec::None, std::path::Path::new("/tmp")));
        let running = reaper.start(&spec, &logger).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), running.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.error.as_deref(), Some("exit status 1"));
        reaper.shutdown();
    }

    #[tokio::test]
    async fn child_output_lands_in_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let reaper = Reaper::new();
        let spec = build_child_spec(&cfg(
            "sh -c 'echo out-line; echo err-line >&2'",
            LogSpec::None,
        ))
        .unwrap();
        let log_spec = LogSpec::File {
            max_size: 0,
            count: 0,
        };
        let logger = Arc::new(Logger::new(&log_spec, dir.path()));
        logger.open("svc").unwrap();
        let running = reaper.start(&spec, &logger).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), running.exit).await;
        // Give the pumps a moment to hit EOF and flush.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let contents = std::fs::read_to_string(dir.path().join("svc.log")).unwrap();
        assert!(contents.contains("[stdout]"), "log was: {contents:?}");
        assert!(contents.contains("out-line"), "log was: {contents:?}");
        assert!(contents.contains("[stderr]"), "log was: {contents:?}");
        assert!(contents.contains("err-line"), "log was: {contents:?}");
        reaper.shutdown();
    }
}
