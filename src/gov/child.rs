use crate::gov::config::Config;
use anyhow::Context as _;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A fully resolved child invocation: absolute executable, working
/// directory, merged environment and credentials. Built once per spawn from
/// the service's current config.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub uid: u32,
    pub gid: u32,
    pub max_open_files: Option<u64>,
}

/// Split a command line on whitespace, honoring single and double quotes.
pub fn split_command(command: &str) -> anyhow::Result<Vec<String>> {
    let mut fields: Vec<String> = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    let mut in_field = false;
    for c in command.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    cur.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_field = true;
                }
                c if c.is_whitespace() => {
                    if in_field {
                        fields.push(std::mem::take(&mut cur));
                        in_field = false;
                    }
                }
                c => {
                    cur.push(c);
                    in_field = true;
                }
            },
        }
    }
    if let Some(q) = quote {
        anyhow::bail!("unbalanced {q} quote in command {command:?}");
    }
    if in_field {
        fields.push(cur);
    }
    anyhow::ensure!(!fields.is_empty(), "no command");
    Ok(fields)
}

/// Resolve a bare program name through PATH. Absolute paths pass through.
pub fn lookup_path(name: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(name);
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let path = std::env::var("PATH").unwrap_or_default();
    for dir in path.split(':').filter(|d| !d.is_empty()) {
        let cand = Path::new(dir).join(name);
        if let Ok(md) = std::fs::metadata(&cand) {
            if md.is_file() && md.permissions().mode() & 0o111 != 0 {
                return Ok(cand);
            }
        }
    }
    anyhow::bail!("executable {name:?} not found in PATH")
}

fn resolve_credentials(cfg: &Config, exe: &Path) -> anyhow::Result<(u32, u32)> {
    let (mut uid, mut gid) = if cfg.inherit_exec_owner {
        let md = std::fs::metadata(exe)
            .with_context(|| format!("stat {}", exe.display()))?;
        (md.uid(), md.gid())
    } else {
        (0, 0)
    };
    if !cfg.group.is_empty() {
        let grp = users::get_group_by_name(&cfg.group)
            .ok_or_else(|| anyhow::anyhow!("invalid group {:?}", cfg.group))?;
        gid = grp.gid();
    }
    if !cfg.user.is_empty() {
        let usr = users::get_user_by_name(&cfg.user)
            .ok_or_else(|| anyhow::anyhow!("invalid user {:?}", cfg.user))?;
        uid = usr.uid();
        if gid == 0 {
            gid = usr.primary_group_id();
        }
    }
    Ok((uid, gid))
}

fn merge_env(cfg: &Config) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut seen: BTreeMap<&str, ()> = BTreeMap::new();
    for (k, v) in &cfg.env {
        env.push((k.clone(), v.clone()));
        seen.insert(k.as_str(), ());
    }
    if cfg.inject_gomaxprocs && !cfg.env.contains_key("GOMAXPROCS") {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        env.push(("GOMAXPROCS".to_string(), ncpu.to_string()));
    }
    for (k, v) in std::env::vars() {
        if !seen.contains_key(k.as_str()) {
            env.push((k, v));
        }
    }
    env
}

/// Resolve a config into a spawnable invocation. Errors here are config
/// errors (bad command, unknown executable, invalid user/group), reported to
/// the operator through the service's start path.
pub fn build_child_spec(cfg: &Config) -> anyhow::Result<ChildSpec> {
    if let Some(err) = cfg.err.as_deref() {
        anyhow::bail!("{err}");
    }
    anyhow::ensure!(!cfg.command.trim().is_empty(), "no command");
    let mut fields = split_command(&cfg.command)?;
    let path = lookup_path(&fields[0])?;
    fields[0] = path.display().to_string();
    let dir = if cfg.dir.is_empty() {
        path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf()
    } else {
        PathBuf::from(&cfg.dir)
    };
    let (uid, gid) = resolve_credentials(cfg, &path)?;
    let env = merge_env(cfg);
    log::debug!(
        "{} wd: {}, uid: {uid}, gid: {gid}",
        cfg.service_name(),
        dir.display()
    );
    Ok(ChildSpec {
        path,
        args: fields,
        dir,
        env,
        uid,
        gid,
        max_open_files: cfg.max_open_files,
    })
}

impl ChildSpec {
    /// Build the `Command`: argv, cwd, environment, credentials and the
    /// parent-death signal (best-effort, Linux only). stdout/stderr come
    /// back as pipes for the reaper's capture loop.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.args(&self.args[1..]);
        cmd.arg0(&self.args[0]);
        cmd.current_dir(&self.dir);
        cmd.env_clear();
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if self.uid != 0 || self.gid != 0 {
            cmd.uid(self.uid);
            cmd.gid(self.gid);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                // Ask the kernel to signal us if the supervisor dies.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGQUIT);
                Ok(())
            });
        }
        cmd
    }
}

// -------- rlimits around spawn --------

pub struct SavedLimit {
    resource: Resource,
    soft: u64,
    hard: u64,
}

/// Apply the spec's rlimits to the calling process, returning the previous
/// values so they can be restored after the spawn. The caller must hold the
/// process-wide start lock so a temporary limit never leaks to a sibling
/// spawn.
pub fn set_limits(spec: &ChildSpec) -> anyhow::Result<Vec<SavedLimit>> {
    let mut saved = Vec::new();
    if let Some(max) = spec.max_open_files {
        let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)
            .map_err(|e| anyhow::anyhow!("getrlimit NOFILE: {e}"))?;
        saved.push(SavedLimit {
            resource: Resource::RLIMIT_NOFILE,
            soft,
            hard,
        });
        setrlimit(Resource::RLIMIT_NOFILE, max, max)
            .map_err(|e| anyhow::anyhow!("setrlimit NOFILE to {max}: {e}"))?;
    }
    Ok(saved)
}

pub fn restore_limits(saved: Vec<SavedLimit>) -> anyhow::Result<()> {
    for l in saved {
        setrlimit(l.resource, l.soft, l.hard)
            .map_err(|e| anyhow::anyhow!("restoring rlimit: {e}"))?;
    }
    Ok(())
}
