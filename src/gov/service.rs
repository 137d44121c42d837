use crate::gov::child::build_child_spec;
use crate::gov::config::Config;
use crate::gov::logger::Logger;
use crate::gov::reaper::{ChildExit, Reaper};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A child must stay alive this long for the spawn to count as a successful
/// start; anything shorter is a failed start and feeds the backoff.
pub const MIN_SETTLE: Duration = Duration::from_millis(1100);
pub const MAX_RETRIES: u32 = 10;
const GRACEFUL_STOP: Duration = Duration::from_secs(10);
const HARD_STOP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Stopping,
    Started,
    Starting,
    Backoff,
    Failed,
}

impl State {
    pub fn is_run_state(self) -> bool {
        matches!(self, State::Started | State::Starting)
    }

    pub fn can_stop(self) -> bool {
        self.is_run_state() || self == State::Backoff
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Stopped => "STOPPED",
            State::Stopping => "STOPPING",
            State::Started => "RUNNING",
            State::Starting => "STARTING",
            State::Backoff => "BACKOFF",
            State::Failed => "FAILED",
        }
    }
}

/// Read-only view of a service for `list` and the coordinator.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub name: String,
    pub file: String,
    pub state: State,
    pub started: Option<DateTime<Local>>,
    pub restarts: u32,
    pub err: Option<String>,
    pub retries: u32,
    pub next_start_in: Option<Duration>,
    pub pid: Option<i32>,
    pub auto_start: bool,
    pub priority: i32,
}

struct Shared {
    config: Config,
    name: String,
    state: State,
    started: Option<DateTime<Local>>,
    restarts: u32,
    err: Option<String>,
    retries: u32,
    next_start: Option<Instant>,
    pid: Option<i32>,
    logger: Arc<Logger>,
}

enum Cmd {
    Start(oneshot::Sender<anyhow::Result<()>>),
    Stop(oneshot::Sender<anyhow::Result<()>>),
    Swap(Config, oneshot::Sender<()>),
    Bounce,
}

/// One supervised child program. All state transitions run on a dedicated
/// actor task fed by an inbox, so per-service Start/Stop are strictly
/// serialized; observers read a shared snapshot under a short-held mutex.
pub struct Service {
    shared: Arc<Mutex<Shared>>,
    tx: mpsc::UnboundedSender<Cmd>,
}

impl Service {
    /// `name` is the coordinator-assigned unique display name; it doubles as
    /// the log sink's name.
    pub fn new(cfg: Config, name: String, reaper: Reaper, log_dir: PathBuf) -> Service {
        let logger = Arc::new(Logger::new(&cfg.log, &log_dir));
        let shared = Arc::new(Mutex::new(Shared {
            config: cfg,
            name,
            state: State::Stopped,
            started: None,
            restarts: 0,
            err: None,
            retries: 0,
            next_start: None,
            pid: None,
            logger,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            shared: Arc::clone(&shared),
            reaper,
            log_dir,
            tx: tx.clone(),
            rx,
            exit_rx: None,
            settle_at: None,
            spawn_instant: Instant::now(),
            pending_start: None,
            watchdog: None,
        };
        tokio::spawn(actor.run());
        Service { shared, tx }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Start(tx))
            .map_err(|_| anyhow::anyhow!("service is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("service is gone"))?
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Cmd::Stop(tx))
            .map_err(|_| anyhow::anyhow!("service is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("service is gone"))?
    }

    /// Replace the config wholesale (the caller has already ruled out
    /// deep-equal no-ops). A Started service is stopped first and started
    /// again with the new config when the stop succeeded.
    pub async fn swap_config(&self, cfg: Config) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Cmd::Swap(cfg, tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        let sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        ServiceSnapshot {
            name: sh.name.clone(),
            file: sh.config.file.clone(),
            state: sh.state,
            started: sh.started,
            restarts: sh.restarts,
            err: sh.err.clone(),
            retries: sh.retries,
            next_start_in: sh
                .next_start
                .map(|at| at.saturating_duration_since(Instant::now())),
            pid: sh.pid,
            auto_start: sh.config.start,
            priority: sh.config.priority,
        }
    }

    pub fn name(&self) -> String {
        self.shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .name
            .clone()
    }

    pub fn file(&self) -> String {
        self.shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .config
            .file
            .clone()
    }

    pub fn state(&self) -> State {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    pub fn config(&self) -> Config {
        self.shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .config
            .clone()
    }

    pub fn logger(&self) -> Arc<Logger> {
        Arc::clone(&self.shared.lock().unwrap_or_else(|p| p.into_inner()).logger)
    }
}

enum StartError {
    /// Bad config (command, executable, credentials): no retry, Failed.
    Config(anyhow::Error),
    /// fork/exec failure: retried with backoff.
    Spawn(anyhow::Error),
}

enum StopOutcome {
    Stopped,
    Stuck,
}

struct Actor {
    shared: Arc<Mutex<Shared>>,
    reaper: Reaper,
    log_dir: PathBuf,
    tx: mpsc::UnboundedSender<Cmd>,
    rx: mpsc::UnboundedReceiver<Cmd>,
    exit_rx: Option<oneshot::Receiver<ChildExit>>,
    settle_at: Option<Instant>,
    spawn_instant: Instant,
    pending_start: Option<oneshot::Sender<anyhow::Result<()>>>,
    watchdog: Option<JoinHandle<()>>,
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn recv_exit(rx: &mut Option<oneshot::Receiver<ChildExit>>) -> ChildExit {
    match rx {
        Some(r) => match r.await {
            Ok(e) => e,
            Err(_) => ChildExit {
                error: Some("lost track of child".to_string()),
            },
        },
        None => std::future::pending().await,
    }
}

fn is_gone(r: nix::Result<()>) -> bool {
    matches!(r, Err(Errno::ESRCH))
}

enum Event {
    Cmd(Option<Cmd>),
    Exit(ChildExit),
    Settled,
    Retry,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let next_start = self
                .shared
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .next_start;
            let ev = tokio::select! {
                cmd = self.rx.recv() => Event::Cmd(cmd),
                exit = recv_exit(&mut self.exit_rx) => Event::Exit(exit),
                _ = sleep_opt(self.settle_at) => Event::Settled,
                _ = sleep_opt(next_start) => Event::Retry,
            };
            match ev {
                Event::Cmd(Some(Cmd::Start(resp))) => self.handle_start(resp),
                Event::Cmd(Some(Cmd::Stop(resp))) => self.handle_stop(resp).await,
                Event::Cmd(Some(Cmd::Swap(cfg, ack))) => {
                    self.handle_swap(cfg).await;
                    let _ = ack.send(());
                }
                Event::Cmd(Some(Cmd::Bounce)) => self.handle_bounce().await,
                Event::Cmd(None) => break,
                Event::Exit(exit) => self.handle_exit(exit),
                Event::Settled => self.handle_settled(),
                Event::Retry => self.handle_retry(),
            }
        }
        self.stop_watchdog();
    }

    fn name(&self) -> String {
        self.shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .name
            .clone()
    }

    fn logger(&self) -> Arc<Logger> {
        Arc::clone(&self.shared.lock().unwrap_or_else(|p| p.into_inner()).logger)
    }

    fn infof(&self, msg: &str) {
        log::info!("[{}] {}", self.name(), msg);
        self.logger().write_str("info", msg);
    }

    fn errorf(&self, msg: &str) {
        log::error!("[{}] {}", self.name(), msg);
        self.logger().write_str("error", msg);
    }

    fn handle_start(&mut self, resp: oneshot::Sender<anyhow::Result<()>>) {
        {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if sh.state.is_run_state() {
                let _ = resp.send(Ok(()));
                return;
            }
            // An explicit start resets the failure budget and cancels any
            // scheduled retry.
            if sh.state == State::Failed {
                sh.retries = 0;
            }
            sh.next_start = None;
        }
        let name = self.name();
        if let Err(e) = self.logger().open(&name) {
            let _ = resp.send(Err(e));
            return;
        }
        self.begin_start(Some(resp));
    }

    /// Spawn the child and enter Starting. The start reply (when present)
    /// stays pending until the settle timer or the first failure decides the
    /// outcome.
    fn begin_start(&mut self, resp: Option<oneshot::Sender<anyhow::Result<()>>>) {
        self.pending_start = resp;
        match self.spawn_child() {
            Ok(()) => {
                let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                sh.state = State::Starting;
                sh.started = Some(Local::now());
                drop(sh);
                self.settle_at = Some(Instant::now() + MIN_SETTLE);
                self.infof("starting");
            }
            Err(StartError::Config(e)) => {
                {
                    let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    sh.state = State::Failed;
                    sh.err = Some(format!("{e:#}"));
                }
                self.errorf(&format!("could not initialize: {e:#}"));
                if let Some(resp) = self.pending_start.take() {
                    let _ = resp.send(Err(e));
                }
            }
            Err(StartError::Spawn(e)) => {
                self.errorf(&format!("failed to start: {e:#}"));
                self.start_failed(format!("{e:#}"));
            }
        }
    }

    fn spawn_child(&mut self) -> Result<(), StartError> {
        let config = self
            .shared
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .config
            .clone();
        let spec = build_child_spec(&config).map_err(StartError::Config)?;
        let logger = self.logger();
        let running = self
            .reaper
            .start(&spec, &logger)
            .map_err(StartError::Spawn)?;
        self.spawn_instant = Instant::now();
        self.exit_rx = Some(running.exit);
        let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        sh.pid = Some(running.pid);
        Ok(())
    }

    fn handle_settled(&mut self) {
        self.settle_at = None;
        {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if sh.state != State::Starting {
                return;
            }
            sh.state = State::Started;
            sh.err = None;
            sh.retries = 0;
        }
        if let Some(resp) = self.pending_start.take() {
            let _ = resp.send(Ok(()));
        }
        self.start_watchdog();
        self.infof("started");
    }

    fn handle_exit(&mut self, exit: ChildExit) {
        self.exit_rx = None;
        let state = {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.pid = None;
            sh.state
        };
        match state {
            State::Starting => {
                self.settle_at = None;
                let since = self.spawn_instant.elapsed();
                let msg = match exit.error {
                    Some(e) => format!("exited too fast ({}ms): {e}", since.as_millis()),
                    None => format!("exited too fast ({}ms)", since.as_millis()),
                };
                self.errorf(&msg);
                self.start_failed(msg);
            }
            State::Started => {
                self.stop_watchdog();
                {
                    let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    sh.restarts += 1;
                }
                match exit.error {
                    Some(e) => self.infof(&format!("exited with error {e} - restarting")),
                    None => self.infof("exited without error - restarting"),
                }
                self.begin_start(None);
            }
            // Stale notifications (already stopped, failed or backing off).
            _ => {}
        }
    }

    fn start_failed(&mut self, err: String) {
        if let Some(resp) = self.pending_start.take() {
            let _ = resp.send(Err(anyhow::anyhow!("{err}")));
        }
        let retries = {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.err = Some(err);
            sh.retries
        };
        if retries < MAX_RETRIES - 1 {
            let delay = Duration::from_secs(1u64 << retries);
            {
                let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                sh.state = State::Backoff;
                sh.next_start = Some(Instant::now() + delay);
                sh.retries += 1;
            }
            self.infof(&format!("will retry in {}s", delay.as_secs()));
        } else {
            {
                let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                sh.state = State::Failed;
                sh.next_start = None;
            }
            self.errorf("maximum retries reached");
        }
    }

    fn handle_retry(&mut self) {
        {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.next_start = None;
            if sh.state != State::Backoff {
                return;
            }
        }
        self.begin_start(None);
    }

    async fn handle_stop(&mut self, resp: oneshot::Sender<anyhow::Result<()>>) {
        let r = self.stop_now().await;
        let _ = resp.send(r);
    }

    async fn stop_now(&mut self) -> anyhow::Result<()> {
        self.stop_watchdog();
        if let Some(resp) = self.pending_start.take() {
            let _ = resp.send(Err(anyhow::anyhow!("stopped")));
        }
        let (state, pid) = {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.next_start = None;
            (sh.state, sh.pid)
        };
        if !state.is_run_state() {
            if state.can_stop() {
                self.infof("stopped");
            }
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.state = State::Stopped;
            return Ok(());
        }
        let prev = state;
        {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.state = State::Stopping;
        }
        self.infof("stopping");
        let outcome = match pid {
            Some(pid) => self.stop_child(pid).await,
            None => StopOutcome::Stopped,
        };
        match outcome {
            StopOutcome::Stopped => {
                self.settle_at = None;
                self.exit_rx = None;
                {
                    let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    sh.state = State::Stopped;
                    sh.restarts = 0;
                    sh.pid = None;
                }
                self.logger().close();
                self.infof("stopped");
                Ok(())
            }
            StopOutcome::Stuck => {
                {
                    let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
                    sh.state = prev;
                }
                self.errorf("could not stop, probably stuck");
                Err(anyhow::anyhow!("could not stop, probably stuck"))
            }
        }
    }

    /// SIGTERM, grace window, SIGKILL, hard window, then a signal-0 probe.
    /// A process that is gone (ESRCH) at any step counts as stopped;
    /// anything still answering the probe is reported stuck.
    async fn stop_child(&mut self, pid: i32) -> StopOutcome {
        let p = Pid::from_raw(pid);
        if is_gone(kill(p, Signal::SIGTERM)) {
            return StopOutcome::Stopped;
        }
        if tokio::time::timeout(GRACEFUL_STOP, recv_exit(&mut self.exit_rx))
            .await
            .is_ok()
        {
            return StopOutcome::Stopped;
        }
        if is_gone(kill(p, Signal::SIGKILL)) {
            return StopOutcome::Stopped;
        }
        if tokio::time::timeout(HARD_STOP, recv_exit(&mut self.exit_rx))
            .await
            .is_ok()
        {
            return StopOutcome::Stopped;
        }
        // Signal 0 tests reachability without sending anything.
        if is_gone(kill(p, None)) {
            return StopOutcome::Stopped;
        }
        StopOutcome::Stuck
    }

    async fn handle_swap(&mut self, cfg: Config) {
        let was_started = {
            let sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.state == State::Started
        };
        let mut restart = false;
        if was_started {
            restart = self.stop_now().await.is_ok();
        }
        log::debug!("changed service {}'s configuration", self.name());
        let new_logger = Arc::new(Logger::new(&cfg.log, &self.log_dir));
        {
            let mut sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            sh.config = cfg;
            sh.logger = new_logger;
        }
        if restart {
            let name = self.name();
            if let Err(e) = self.logger().open(&name) {
                self.errorf(&format!("error opening log: {e:#}"));
                return;
            }
            self.begin_start(None);
        }
    }

    async fn handle_bounce(&mut self) {
        {
            let sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if sh.state != State::Started {
                return;
            }
        }
        if self.stop_now().await.is_err() {
            return;
        }
        let name = self.name();
        if let Err(e) = self.logger().open(&name) {
            self.errorf(&format!("error opening log: {e:#}"));
            return;
        }
        self.begin_start(None);
    }

    fn start_watchdog(&mut self) {
        self.stop_watchdog();
        let (probe, interval, name) = {
            let sh = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            match sh.config.watchdog.clone() {
                Some(p) => (p, sh.config.watchdog_interval.max(1), sh.name.clone()),
                None => return,
            }
        };
        let tx = self.tx.clone();
        let period = Duration::from_secs(interval);
        self.watchdog = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if let Err(e) = probe.check().await {
                    log::error!("{name}'s watchdog returned an error: {e:#}");
                    if tx.send(Cmd::Bounce).is_err() {
                        break;
                    }
                }
            }
        }));
    }

    fn stop_watchdog(&mut self) {
        if let Some(h) = self.watchdog.take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gov::logger::LogSpec;
    use std::collections::BTreeMap;

    fn cfg(command: &str, name: &str) -> Config {
        Config {
            file: format!("{name}.conf"),
            command: command.to_string(),
            name: name.to_string(),
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
            log: LogSpec::None,
            err: None,
        }
    }

    fn make(command: &str, name: &str, reaper: &Reaper) -> Service {
        Service::new(
            cfg(command, name),
            name.to_string(),
            reaper.clone(),
            std::env::temp_dir(),
        )
    }

    async fn wait_until<F: Fn(&ServiceSnapshot) -> bool>(
        s: &Service,
        timeout: Duration,
        pred: F,
    ) -> ServiceSnapshot {
        let deadline = Instant::now() + timeout;
        loop {
            let snap = s.snapshot();
            if pred(&snap) {
                return snap;
            }
            if Instant::now() >= deadline {
                panic!("condition not reached; last snapshot: {snap:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn normal_lifecycle_with_crash_restart() {
        let reaper = Reaper::new();
        let s = make("sleep 50000", "sleep-test", &reaper);
        s.start().await.expect("start failed");
        let snap = s.snapshot();
        assert_eq!(snap.state, State::Started);
        let pid = snap.pid.expect("no pid after start");

        kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
        let snap = wait_until(&s, Duration::from_secs(10), |sn| {
            sn.state == State::Started && sn.restarts == 1
        })
        .await;
        assert_ne!(snap.pid, Some(pid));

        s.stop().await.expect("stop failed");
        let snap = s.snapshot();
        assert_eq!(snap.state, State::Stopped);
        assert_eq!(snap.restarts, 0);
        reaper.shutdown();
    }

    #[tokio::test]
    async fn start_on_running_service_is_a_noop() {
        let reaper = Reaper::new();
        let s = make("sleep 50000", "noop-test", &reaper);
        s.start().await.unwrap();
        let pid = s.snapshot().pid;
        s.start().await.unwrap();
        assert_eq!(s.snapshot().pid, pid);
        s.stop().await.unwrap();
        reaper.shutdown();
    }

    #[tokio::test]
    async fn fast_exit_enters_backoff_and_stop_cancels_it() {
        let reaper = Reaper::new();
        let s = make("true", "fast-exit", &reaper);
        let err = s.start().await.expect_err("start should have failed");
        assert!(err.to_string().contains("too fast"), "got: {err:#}");
        let snap = s.snapshot();
        assert_eq!(snap.state, State::Backoff);
        assert_eq!(snap.retries, 1);
        let next = snap.next_start_in.expect("no retry scheduled");
        assert!(next > Duration::ZERO && next <= Duration::from_secs(1));

        s.stop().await.expect("stop failed");
        assert_eq!(s.snapshot().state, State::Stopped);
        // The canceled retry must never fire.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snap = s.snapshot();
        assert_eq!(snap.state, State::Stopped);
        assert_eq!(snap.restarts, 0);
        reaper.shutdown();
    }

    #[tokio::test]
    async fn stop_on_stopped_service_is_a_noop() {
        let reaper = Reaper::new();
        let s = make("sleep 50000", "stopped-noop", &reaper);
        s.stop().await.expect("stop on stopped service errored");
        assert_eq!(s.snapshot().state, State::Stopped);
        reaper.shutdown();
    }

    #[tokio::test]
    async fn config_error_fails_the_start() {
        let reaper = Reaper::new();
        let mut c = cfg("sleep 1", "broken");
        c.err = Some("bad config".to_string());
        let s = Service::new(c, "broken".to_string(), reaper.clone(), std::env::temp_dir());
        let err = s.start().await.expect_err("start should fail");
        assert!(err.to_string().contains("bad config"));
        assert_eq!(s.snapshot().state, State::Failed);
        reaper.shutdown();
    }

    #[tokio::test]
    async fn unknown_executable_fails_the_start() {
        let reaper = Reaper::new();
        let s = make("no-such-binary-xyz 1", "missing-bin", &reaper);
        assert!(s.start().await.is_err());
        assert_eq!(s.snapshot().state, State::Failed);
        reaper.shutdown();
    }

    #[tokio::test]
    async fn watchdog_failure_bounces_the_service() {
        let reaper = Reaper::new();
        let mut c = cfg("sleep 50000", "bounce-test");
        c.watchdog = Some(crate::gov::watchdog::Probe::Run {
            argv: vec!["false".to_string()],
        });
        c.watchdog_interval = 1;
        let s = Service::new(
            c,
            "bounce-test".to_string(),
            reaper.clone(),
            std::env::temp_dir(),
        );
        s.start().await.unwrap();
        let pid = s.snapshot().pid.unwrap();
        let snap = wait_until(&s, Duration::from_secs(15), |sn| {
            sn.state == State::Started && sn.pid.is_some() && sn.pid != Some(pid)
        })
        .await;
        assert_eq!(snap.state, State::Started);
        s.stop().await.unwrap();
        reaper.shutdown();
    }

    #[tokio::test]
    async fn swap_config_bounces_a_running_service() {
        let reaper = Reaper::new();
        let s = make("sleep 50000", "swap-test", &reaper);
        s.start().await.unwrap();
        let pid = s.snapshot().pid.unwrap();
        let mut next = cfg("sleep 40000", "swap-test");
        next.priority = 7;
        s.swap_config(next).await;
        let snap = wait_until(&s, Duration::from_secs(10), |sn| {
            sn.state == State::Started && sn.pid != Some(pid)
        })
        .await;
        assert_eq!(snap.priority, 7);
        s.stop().await.unwrap();
        reaper.shutdown();
    }

    #[tokio::test]
    async fn swap_config_on_stopped_service_does_not_start_it() {
        let reaper = Reaper::new();
        let s = make("sleep 50000", "swap-stopped", &reaper);
        s.swap_config(cfg("sleep 40000", "swap-stopped")).await;
        assert_eq!(s.snapshot().state, State::Stopped);
        assert_eq!(s.config().command, "sleep 40000");
        reaper.shutdown();
    }
}
