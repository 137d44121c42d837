use crate::gov::logger::LogSpec;
use crate::gov::watchdog::Probe;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const APP_NAME: &str = "governator";

pub fn default_config_dir() -> String {
    format!("/etc/{APP_NAME}")
}

pub fn default_server_addr() -> String {
    format!("unix:///tmp/{APP_NAME}.sock")
}

pub fn default_log_dir() -> String {
    format!("/var/log/{APP_NAME}")
}

/// One service definition, parsed from a file under `<config-dir>/services`.
///
/// A config is immutable once parsed; reloads replace it wholesale. A parse
/// failure does not drop the service: the error is preserved in `err` and
/// every spawn attempt fails with it, so the operator sees the problem in
/// `list` instead of the service silently disappearing.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Source filename (identity for reload; unique per services directory).
    pub file: String,
    pub command: String,
    pub name: String,
    pub dir: String,
    pub env: BTreeMap<String, String>,
    /// Auto-start when the supervisor (re)loads.
    pub start: bool,
    pub user: String,
    pub group: String,
    /// Lower starts first, stops last.
    pub priority: i32,
    pub max_open_files: Option<u64>,
    /// Inject GOMAXPROCS=<ncpu> into the child environment when absent.
    pub inject_gomaxprocs: bool,
    /// Default uid/gid to the executable file's owner when user/group are
    /// not set. Off by default; the historical behavior was surprising.
    pub inherit_exec_owner: bool,
    pub watchdog: Option<Probe>,
    /// Seconds between watchdog probes.
    pub watchdog_interval: u64,
    pub log: LogSpec,
    pub err: Option<String>,
}

impl Config {
    pub fn service_name(&self) -> &str {
        if self.name.is_empty() {
            &self.file
        } else {
            &self.name
        }
    }

    fn empty(file: &str) -> Config {
        Config {
            file: file.to_string(),
            command: String::new(),
            name: String::new(),
            dir: String::new(),
            env: BTreeMap::new(),
            start: default_start(),
            user: String::new(),
            group: String::new(),
            priority: default_priority(),
            max_open_files: None,
            inject_gomaxprocs: default_inject_gomaxprocs(),
            inherit_exec_owner: false,
            watchdog: None,
            watchdog_interval: default_watchdog_interval(),
            log: LogSpec::default(),
            err: None,
        }
    }
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_start")]
    start: bool,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    max_open_files: Option<u64>,
    #[serde(default = "default_inject_gomaxprocs")]
    inject_gomaxprocs: bool,
    #[serde(default)]
    inherit_exec_owner: bool,
    /// Probe spec: `run <argv…>` | `connect [proto://]host:port [secs]` | `get <url> [secs]`
    #[serde(default)]
    watchdog: Option<String>,
    #[serde(default = "default_watchdog_interval")]
    watchdog_interval: u64,
    /// Sink spec: `file [maxSize [count]]` | `syslog [url]` | `none`
    #[serde(default)]
    log: Option<String>,
}

fn default_start() -> bool {
    true
}
fn default_priority() -> i32 {
    1000
}
fn default_watchdog_interval() -> u64 {
    300
}
fn default_inject_gomaxprocs() -> bool {
    true
}

fn build_config(file: &str, raw: &str) -> anyhow::Result<Config> {
    let fc: ConfigFile = serde_yaml::from_str(raw)
        .map_err(|e| anyhow::anyhow!("failed to parse service config {file}: {e}"))?;
    let watchdog = match fc.watchdog.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(spec) => Some(Probe::parse(spec)?),
        None => None,
    };
    let log = match fc.log.as_deref() {
        Some(spec) => LogSpec::parse(spec)?,
        None => LogSpec::default(),
    };
    Ok(Config {
        file: file.to_string(),
        command: fc.command.unwrap_or_default(),
        name: fc.name.unwrap_or_default(),
        dir: fc.dir.unwrap_or_default(),
        env: fc.env,
        start: fc.start,
        user: fc.user.unwrap_or_default(),
        group: fc.group.unwrap_or_default(),
        priority: fc.priority,
        max_open_files: fc.max_open_files,
        inject_gomaxprocs: fc.inject_gomaxprocs,
        inherit_exec_owner: fc.inherit_exec_owner,
        watchdog,
        watchdog_interval: fc.watchdog_interval,
        log,
        err: None,
    })
}

/// Parse one service file. Errors are captured on the returned config rather
/// than propagated, so the service registers and reports them at start time.
pub fn parse_config(services_dir: &Path, filename: &str) -> Config {
    let path = services_dir.join(filename);
    let cfg = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("failed to read service config {}: {e}", path.display()))
        .and_then(|raw| build_config(filename, &raw));
    match cfg {
        Ok(cfg) => cfg,
        Err(e) => {
            let mut cfg = Config::empty(filename);
            cfg.err = Some(format!("{e:#}"));
            cfg
        }
    }
}

/// Parse every service file in the directory, skipping dotfiles, editor
/// leftovers (`~` suffix), empty files and subdirectories.
pub fn parse_configs(services_dir: &Path) -> anyhow::Result<Vec<Config>> {
    let entries = std::fs::read_dir(services_dir).map_err(|e| {
        anyhow::anyhow!(
            "error reading services directory {}: {e}",
            services_dir.display()
        )
    })?;
    let mut names: Vec<String> = Vec::new();
    for ent in entries {
        let ent = ent?;
        let name = ent.file_name().to_string_lossy().to_string();
        if should_ignore_file(services_dir, &name, false) {
            continue;
        }
        names.push(name);
    }
    names.sort();
    let mut configs = Vec::with_capacity(names.len());
    for name in &names {
        let cfg = parse_config(services_dir, name);
        log::debug!("parsed config {name}: {cfg:?}");
        configs.push(cfg);
    }
    Ok(configs)
}

/// Files the supervisor never treats as service definitions. For delete and
/// rename events the file is gone, so only the name rules apply.
pub fn should_ignore_file(services_dir: &Path, name: &str, deleted: bool) -> bool {
    if name.is_empty() || name.starts_with('.') || name.ends_with('~') {
        return true;
    }
    if !deleted {
        match std::fs::metadata(services_dir.join(name)) {
            Ok(md) => md.len() == 0 || md.is_dir(),
            Err(_) => true,
        }
    } else {
        false
    }
}
