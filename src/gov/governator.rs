use crate::gov::config::{parse_config, parse_configs, should_ignore_file, Config, APP_NAME};
use crate::gov::logger::Logger;
use crate::gov::reaper::Reaper;
use crate::gov::server;
use crate::gov::service::{Service, ServiceSnapshot, State};
use crate::gov::watcher::{watch_dir, FileEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};

/// One tagged record of a control response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    End,
    Ok,
    Err,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub kind: RecordKind,
    pub text: String,
}

/// Where progress records of an operation go. Control connections stream
/// them over the wire; internal callers discard them.
#[derive(Clone)]
pub struct Reply {
    tx: Option<mpsc::UnboundedSender<Record>>,
}

impl Reply {
    pub fn new(tx: mpsc::UnboundedSender<Record>) -> Reply {
        Reply { tx: Some(tx) }
    }

    pub fn discard() -> Reply {
        Reply { tx: None }
    }

    pub fn ok(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Record {
                kind: RecordKind::Ok,
                text: text.into(),
            });
        }
    }

    pub fn err(&self, text: impl Into<String>) {
        let text = text.into();
        log::error!("{}", text.trim_end());
        if let Some(tx) = &self.tx {
            let _ = tx.send(Record {
                kind: RecordKind::Err,
                text,
            });
        }
    }
}

/// The coordinator: owns the service set, enforces priority order and name
/// uniqueness, reacts to configuration-file events and drives the main
/// lifecycle. List mutations are serialized by the services lock; bulk
/// operations hold it for their whole walk.
pub struct Governator {
    config_dir: PathBuf,
    server_addr: String,
    log_dir: PathBuf,
    services: tokio::sync::Mutex<Vec<Service>>,
    reaper: Reaper,
}

fn sort_services(services: &mut [Service]) {
    // Stable: insertion order breaks priority ties.
    services.sort_by_cached_key(|s| s.snapshot().priority);
}

fn ensure_unique_name(services: &[Service], cfg: &Config) -> String {
    let orig = cfg.service_name().to_string();
    let mut name = orig.clone();
    let mut ii = 1;
    loop {
        let unique = name != "all" && !services.iter().any(|s| s.name() == name);
        if unique {
            return name;
        }
        name = format!("{orig}-{ii}");
        ii += 1;
    }
}

impl Governator {
    /// Must be called from within a tokio runtime (the reaper task starts
    /// immediately).
    pub fn new(config_dir: &Path, server_addr: &str, log_dir: &Path) -> Governator {
        Governator {
            config_dir: config_dir.to_path_buf(),
            server_addr: server_addr.to_string(),
            log_dir: log_dir.to_path_buf(),
            services: tokio::sync::Mutex::new(Vec::new()),
            reaper: Reaper::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn services_dir(&self) -> PathBuf {
        self.config_dir.join("services")
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Parse every service file and install the services, sorted by
    /// priority. Parse errors register too; they surface on start.
    pub async fn load_services(&self) -> anyhow::Result<()> {
        let configs = parse_configs(&self.services_dir())?;
        let mut services = self.services.lock().await;
        for cfg in configs {
            let name = ensure_unique_name(&services, &cfg);
            services.push(Service::new(
                cfg,
                name,
                self.reaper.clone(),
                self.log_dir.clone(),
            ));
        }
        sort_services(&mut services);
        Ok(())
    }

    pub async fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let services = self.services.lock().await;
        services.iter().map(|s| s.snapshot()).collect()
    }

    pub async fn service_logger(&self, name: &str) -> Option<(Arc<Logger>, State)> {
        let services = self.services.lock().await;
        services
            .iter()
            .find(|s| s.name() == name)
            .map(|s| (s.logger(), s.state()))
    }

    async fn start_one(s: &Service, reply: &Reply) {
        let name = s.name();
        reply.ok(format!("starting {name}\n"));
        match s.start().await {
            Ok(()) => reply.ok(format!("started {name}\n")),
            Err(e) => reply.err(format!("error starting {name}: {e:#}\n")),
        }
    }

    async fn stop_one(s: &Service, reply: &Reply) -> bool {
        let name = s.name();
        reply.ok(format!("stopping {name}\n"));
        match s.stop().await {
            Ok(()) => {
                reply.ok(format!("stopped {name}\n"));
                true
            }
            Err(e) => {
                reply.err(format!("error stopping {name}: {e:#}\n"));
                false
            }
        }
    }

    /// Bulk start: ascending priority, auto-start services only.
    async fn start_services(&self, reply: &Reply) {
        let services = self.services.lock().await;
        for s in services.iter() {
            if s.config().start {
                Governator::start_one(s, reply).await;
            }
        }
    }

    /// Bulk stop: descending priority, stoppable services only.
    async fn stop_services(&self, reply: &Reply) {
        let services = self.services.lock().await;
        for s in services.iter().rev() {
            if s.state().can_stop() {
                Governator::stop_one(s, reply).await;
            }
        }
    }

    pub async fn cmd_start(&self, target: &str, reply: &Reply) {
        if target == "all" {
            self.start_services(reply).await;
            return;
        }
        let services = self.services.lock().await;
        match services.iter().find(|s| s.name() == target) {
            None => reply.err(format!("no service named {target}\n")),
            Some(s) if s.state() == State::Started => {
                reply.ok(format!("{target} is already running\n"));
            }
            Some(s) => Governator::start_one(s, reply).await,
        }
    }

    pub async fn cmd_stop(&self, target: &str, reply: &Reply) {
        if target == "all" {
            self.stop_services(reply).await;
            return;
        }
        let services = self.services.lock().await;
        match services.iter().find(|s| s.name() == target) {
            None => reply.err(format!("no service named {target}\n")),
            Some(s) if !s.state().can_stop() => {
                reply.ok(format!("{target} is not running\n"));
            }
            Some(s) => {
                Governator::stop_one(s, reply).await;
            }
        }
    }

    pub async fn cmd_restart(&self, target: &str, reply: &Reply) {
        if target == "all" {
            self.stop_services(reply).await;
            self.start_services(reply).await;
            return;
        }
        let services = self.services.lock().await;
        match services.iter().find(|s| s.name() == target) {
            None => reply.err(format!("no service named {target}\n")),
            Some(s) => {
                let mut stopped = true;
                if s.state().is_run_state() {
                    stopped = Governator::stop_one(s, reply).await;
                }
                if stopped {
                    Governator::start_one(s, reply).await;
                }
            }
        }
    }

    /// Poll until a service backed by `file` registers, up to 10 seconds.
    pub async fn wait_for_file(&self, file: &str) -> bool {
        for _ in 0..10 {
            {
                let services = self.services.lock().await;
                if services.iter().any(|s| s.file() == file) {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    pub async fn handle_event(&self, ev: FileEvent) {
        match ev {
            FileEvent::Created(name) => {
                if should_ignore_file(&self.services_dir(), &name, false) {
                    return;
                }
                let cfg = parse_config(&self.services_dir(), &name);
                let mut services = self.services.lock().await;
                if let Some(s) = services.iter().find(|s| s.file() == name) {
                    // A file moved or copied over an existing service config
                    // produces only a CREATE. Treat it as a config update.
                    if s.config() == cfg {
                        return;
                    }
                    s.swap_config(cfg).await;
                    sort_services(&mut services);
                } else {
                    let unique = ensure_unique_name(&services, &cfg);
                    log::debug!("added service {unique}");
                    let auto_start = cfg.start;
                    services.push(Service::new(
                        cfg,
                        unique.clone(),
                        self.reaper.clone(),
                        self.log_dir.clone(),
                    ));
                    sort_services(&mut services);
                    if auto_start {
                        if let Some(s) = services.iter().find(|s| s.name() == unique) {
                            if let Err(e) = s.start().await {
                                log::error!("error starting {unique}: {e:#}");
                            }
                        }
                    }
                }
            }
            FileEvent::Modified(name) => {
                if should_ignore_file(&self.services_dir(), &name, false) {
                    return;
                }
                let mut services = self.services.lock().await;
                if let Some(s) = services.iter().find(|s| s.file() == name) {
                    let cfg = parse_config(&self.services_dir(), &name);
                    if s.config() == cfg {
                        // Changes to the file that don't affect the conf.
                        return;
                    }
                    s.swap_config(cfg).await;
                    sort_services(&mut services);
                }
            }
            FileEvent::Removed(name) => {
                if should_ignore_file(&self.services_dir(), &name, true) {
                    return;
                }
                let mut services = self.services.lock().await;
                if let Some(pos) = services.iter().position(|s| s.file() == name) {
                    log::debug!("removed service {}", services[pos].name());
                    if services[pos].state().can_stop() {
                        let _ = services[pos].stop().await;
                    }
                    services.remove(pos);
                }
            }
        }
    }

    /// Daemon main: load, watch, serve, start, wait for the first
    /// SIGINT/SIGTERM, then tear everything down in order.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        anyhow::ensure!(
            nix::unistd::geteuid().is_root(),
            "{APP_NAME} daemon must be run as root"
        );
        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            log::warn!("cannot create log directory {}: {e}", self.log_dir.display());
        }
        let services_dir = self.services_dir();
        std::fs::create_dir_all(&services_dir).map_err(|e| {
            anyhow::anyhow!(
                "error creating services directory {}: {e}",
                services_dir.display()
            )
        })?;
        self.load_services().await?;

        let watcher = match watch_dir(&services_dir) {
            Ok((w, mut rx)) => {
                let gov = Arc::clone(&self);
                tokio::spawn(async move {
                    while let Some(ev) = rx.recv().await {
                        gov.handle_event(ev).await;
                    }
                });
                Some(w)
            }
            Err(e) => {
                log::error!(
                    "error watching {}, configuration won't be automatically updated: {e:#}",
                    services_dir.display()
                );
                None
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        if let Err(e) = server::start(Arc::clone(&self), shutdown_rx).await {
            log::error!("error starting server, can't receive remote commands: {e:#}");
        }

        self.start_services(&Reply::discard()).await;

        // The first SIGINT/SIGTERM starts the shutdown; a second one is left
        // to the OS.
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = term.recv() => log::info!("received SIGTERM"),
            _ = int.recv() => log::info!("received SIGINT"),
        }

        let _ = shutdown_tx.send(true);
        drop(watcher);
        self.stop_services(&Reply::discard()).await;
        self.reaper.shutdown();
        log::debug!("daemon exiting");
        Ok(())
    }
}
