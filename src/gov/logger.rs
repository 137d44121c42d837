use anyhow::Context as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::Write as _;
use std::os::unix::net::UnixDatagram;
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Callback attached by the `log` control command; receives every emitted
/// line in addition to the normal write path.
pub type MonitorFn = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

const DEFAULT_MAX_SIZE: u64 = 500 * 1024 * 1024;
const DEFAULT_COUNT: usize = 10;

/// Log-sink spec from a service config: `file [maxSize [count]]`,
/// `syslog [url]` or `none`.
#[derive(Debug, Clone, PartialEq)]
pub enum LogSpec {
    File { max_size: u64, count: usize },
    Syslog { url: Option<String> },
    None,
}

impl Default for LogSpec {
    fn default() -> Self {
        LogSpec::File {
            max_size: DEFAULT_MAX_SIZE,
            count: DEFAULT_COUNT,
        }
    }
}

impl LogSpec {
    pub fn parse(spec: &str) -> anyhow::Result<LogSpec> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.is_empty() {
            return Ok(LogSpec::default());
        }
        match fields[0] {
            "file" => {
                anyhow::ensure!(fields.len() <= 3, "file log takes at most two arguments");
                let max_size = match fields.get(1) {
                    Some(s) => parse_size_bytes(s)?,
                    None => DEFAULT_MAX_SIZE,
                };
                let count = match fields.get(2) {
                    Some(s) => s
                        .parse::<usize>()
                        .map_err(|e| anyhow::anyhow!("invalid log file count {s:?}: {e}"))?,
                    None => DEFAULT_COUNT,
                };
                Ok(LogSpec::File { max_size, count })
            }
            "syslog" => {
                anyhow::ensure!(fields.len() <= 2, "syslog log takes at most one argument");
                Ok(LogSpec::Syslog {
                    url: fields.get(1).map(|s| s.to_string()),
                })
            }
            "none" => {
                anyhow::ensure!(fields.len() == 1, "none log takes no arguments");
                Ok(LogSpec::None)
            }
            other => anyhow::bail!("unknown log sink {other:?} - available sinks are file, syslog and none"),
        }
    }
}

/// Parse a size like `128`, `64K`, `10M` or `1G` into bytes.
pub fn parse_size_bytes(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    anyhow::ensure!(!t.is_empty(), "empty size");
    let (num, mult) = match t.chars().last() {
        Some('k') | Some('K') => (&t[..t.len() - 1], 1024u64),
        Some('m') | Some('M') => (&t[..t.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&t[..t.len() - 1], 1024 * 1024 * 1024),
        _ => (t, 1),
    };
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid size {s:?}: {e}"))?;
    Ok(n * mult)
}

trait LogWriter: Send {
    fn open(&mut self, name: &str) -> anyhow::Result<()>;
    fn write(&mut self, prefix: &str, line: &[u8]) -> anyhow::Result<()>;
    fn flush(&mut self) -> anyhow::Result<()>;
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Per-service log sink. Every emitted line is stamped with an epoch-seconds
/// prefix; the configured writer decides where it lands. Single writer per
/// service, guarded by a short-held mutex.
pub struct Logger {
    writer: Mutex<Box<dyn LogWriter>>,
    monitor: Mutex<Option<MonitorFn>>,
}

impl Logger {
    pub fn new(spec: &LogSpec, dir: &Path) -> Logger {
        let writer: Box<dyn LogWriter> = match spec {
            LogSpec::File { max_size, count } => Box::new(FileWriter::new(dir, *max_size, *count)),
            LogSpec::Syslog { url } => Box::new(SyslogWriter::new(url.clone())),
            LogSpec::None => Box::new(NoneWriter),
        };
        Logger::with_writer(writer)
    }

    fn with_writer(writer: Box<dyn LogWriter>) -> Logger {
        Logger {
            writer: Mutex::new(writer),
            monitor: Mutex::new(None),
        }
    }

    pub fn open(&self, name: &str) -> anyhow::Result<()> {
        let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        w.open(name)
    }

    /// Write one line. A `"<epoch-seconds> - "` prefix is prepended and a
    /// trailing newline synthesized when missing. Writer errors are logged,
    /// not propagated; losing a log line must not take the service down.
    pub fn write(&self, prefix: &str, b: &[u8]) {
        let mut line = format!("{} - ", chrono::Utc::now().timestamp()).into_bytes();
        line.extend_from_slice(b);
        if line.last() != Some(&b'\n') {
            line.push(b'\n');
        }
        {
            let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = w.write(prefix, &line) {
                log::error!("log write failed: {e:#}");
            }
        }
        let mon = self.monitor.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(m) = mon.as_ref() {
            m(prefix, &line);
        }
    }

    pub fn write_str(&self, prefix: &str, s: &str) {
        self.write(prefix, s.as_bytes());
    }

    pub fn flush(&self) {
        let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = w.flush() {
            log::debug!("log flush failed: {e:#}");
        }
    }

    pub fn close(&self) {
        let mut w = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = w.close() {
            log::debug!("log close failed: {e:#}");
        }
    }

    pub fn set_monitor(&self, m: Option<MonitorFn>) {
        *self.monitor.lock().unwrap_or_else(|p| p.into_inner()) = m;
    }

    pub fn has_monitor(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }
}

/// Buffers arbitrary byte chunks from one child fd and forwards whole lines,
/// tagged with its prefix, to the logger.
pub struct LineSink {
    logger: Arc<Logger>,
    prefix: &'static str,
    buf: Vec<u8>,
}

impl LineSink {
    pub fn new(logger: Arc<Logger>, prefix: &'static str) -> LineSink {
        LineSink {
            logger,
            prefix,
            buf: Vec::new(),
        }
    }

    pub fn push(&mut self, b: &[u8]) {
        if b.is_empty() {
            return;
        }
        if self.buf.is_empty() && b.iter().position(|&c| c == b'\n') == Some(b.len() - 1) {
            // Whole single line, no copy needed.
            self.logger.write(self.prefix, b);
            return;
        }
        self.buf.extend_from_slice(b);
        while let Some(p) = self.buf.iter().position(|&c| c == b'\n') {
            let rest = self.buf.split_off(p + 1);
            self.logger.write(self.prefix, &self.buf);
            self.buf = rest;
        }
    }

    /// Emit whatever is buffered. Called when the pipe hits EOF so the tail
    /// of the child's output is not dropped.
    pub fn finish(&mut self) {
        if !self.buf.is_empty() {
            let buf = std::mem::take(&mut self.buf);
            self.logger.write(self.prefix, &buf);
        }
        self.logger.flush();
    }
}

// -------- file writer --------

struct FileWriter {
    dir: PathBuf,
    name: String,
    max_size: u64,
    count: usize,
    size: u64,
    f: Option<fs::File>,
    // Compress synchronously instead of in a background thread (tests only).
    wait_compress: bool,
}

impl FileWriter {
    fn new(dir: &Path, max_size: u64, count: usize) -> FileWriter {
        FileWriter {
            dir: dir.to_path_buf(),
            name: String::new(),
            max_size,
            count,
            size: 0,
            f: None,
            wait_compress: false,
        }
    }

    fn log_path(&self, ii: usize) -> PathBuf {
        if ii == 0 {
            self.dir.join(format!("{}.log", self.name))
        } else {
            self.dir.join(format!("{}.{}.log", self.name, ii))
        }
    }

    fn compressed_log_path(&self, ii: usize) -> PathBuf {
        let mut p = self.log_path(ii).into_os_string();
        p.push(".gz");
        PathBuf::from(p)
    }

    fn rotate(&mut self) -> anyhow::Result<()> {
        self.close()?;
        for last in [
            self.log_path(self.count - 1),
            self.compressed_log_path(self.count - 1),
        ] {
            if last.exists() {
                log::debug!("removing {}", last.display());
                fs::remove_file(&last)
                    .with_context(|| format!("removing {}", last.display()))?;
            }
        }
        let mut compress: Vec<PathBuf> = Vec::new();
        for ii in (0..self.count.saturating_sub(1)).rev() {
            let ccur = self.compressed_log_path(ii);
            if ccur.exists() {
                let to = self.compressed_log_path(ii + 1);
                log::debug!("moving {} to {}", ccur.display(), to.display());
                fs::rename(&ccur, &to)
                    .with_context(|| format!("moving {}", ccur.display()))?;
                continue;
            }
            let cur = self.log_path(ii);
            if cur.exists() {
                let to = self.log_path(ii + 1);
                log::debug!("moving {} to {}", cur.display(), to.display());
                fs::rename(&cur, &to)
                    .with_context(|| format!("moving {}", cur.display()))?;
                compress.push(to);
            }
        }
        for path in compress {
            if self.wait_compress {
                if let Err(e) = compress_file(&path) {
                    log::error!("error compressing {}: {e:#}", path.display());
                }
            } else {
                std::thread::spawn(move || {
                    if let Err(e) = compress_file(&path) {
                        log::error!("error compressing {}: {e:#}", path.display());
                    }
                });
            }
        }
        let name = self.name.clone();
        self.open(&name)
    }
}

impl LogWriter for FileWriter {
    fn open(&mut self, name: &str) -> anyhow::Result<()> {
        match fs::metadata(&self.dir) {
            Ok(md) if md.is_dir() => {}
            _ => {
                let _ = fs::remove_file(&self.dir);
                fs::create_dir_all(&self.dir).with_context(|| {
                    format!("creating log directory {}", self.dir.display())
                })?;
            }
        }
        if self.f.is_some() {
            self.close()?;
        }
        self.name = name.to_string();
        let path = self.log_path(0);
        let f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("error opening log file {}: {e}", path.display()))?;
        self.size = f.metadata().map(|m| m.len()).unwrap_or(0);
        self.f = Some(f);
        log::debug!("opened log file {}", path.display());
        Ok(())
    }

    fn write(&mut self, prefix: &str, line: &[u8]) -> anyhow::Result<()> {
        let f = self
            .f
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("log file not opened"))?;
        let tag = format!("[{prefix}] ");
        f.write_all(tag.as_bytes())?;
        f.write_all(line)?;
        self.size += (tag.len() + line.len()) as u64;
        if self.max_size > 0 && self.count > 0 && self.size > self.max_size {
            log::debug!("rotating log file {}", self.name);
            self.rotate()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if let Some(f) = self.f.as_mut() {
            f.sync_data()?;
        }
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        // Dropping the handle closes it.
        self.f = None;
        Ok(())
    }
}

fn compress_file(path: &Path) -> anyhow::Result<()> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut gz_path = path.as_os_str().to_os_string();
    gz_path.push(".gz");
    let out = fs::File::create(&gz_path)?;
    let mut enc = GzEncoder::new(out, Compression::default());
    enc.write_all(&data)?;
    enc.finish()?;
    fs::remove_file(path)?;
    log::debug!("compressed {}", path.display());
    Ok(())
}

// -------- syslog writer --------

enum SyslogSocket {
    Unix(UnixDatagram),
    Udp(UdpSocket),
}

struct SyslogWriter {
    url: Option<String>,
    tag: String,
    sock: Option<SyslogSocket>,
}

const SYSLOG_FACILITY: u8 = 16; // LOCAL0
const SEVERITY_ERR: u8 = 3;
const SEVERITY_NOTICE: u8 = 5;
const SEVERITY_INFO: u8 = 6;
const SEVERITY_DEBUG: u8 = 7;

impl SyslogWriter {
    fn new(url: Option<String>) -> SyslogWriter {
        SyslogWriter {
            url,
            tag: String::new(),
            sock: None,
        }
    }

    fn dial(url: Option<&str>) -> anyhow::Result<SyslogSocket> {
        match url {
            None => {
                let s = UnixDatagram::unbound()?;
                s.connect("/dev/log")
                    .map_err(|e| anyhow::anyhow!("error connecting to /dev/log: {e}"))?;
                Ok(SyslogSocket::Unix(s))
            }
            Some(u) => {
                let (scheme, addr) = u
                    .split_once("://")
                    .ok_or_else(|| anyhow::anyhow!("invalid syslog url {u:?}"))?;
                match scheme {
                    "unix" => {
                        let s = UnixDatagram::unbound()?;
                        s.connect(addr)
                            .map_err(|e| anyhow::anyhow!("error connecting to {addr}: {e}"))?;
                        Ok(SyslogSocket::Unix(s))
                    }
                    "udp" => {
                        let s = UdpSocket::bind("0.0.0.0:0")?;
                        s.connect(addr)
                            .map_err(|e| anyhow::anyhow!("error connecting to {addr}: {e}"))?;
                        Ok(SyslogSocket::Udp(s))
                    }
                    other => anyhow::bail!("unsupported syslog scheme {other:?}"),
                }
            }
        }
    }
}

/// RFC 3164 style payload: `<PRI>tag: message`. Prefixes with a matching
/// severity map directly; anything else becomes a `[<prefix>]`-tagged
/// message at the default (notice) severity.
fn format_syslog(tag: &str, prefix: &str, line: &[u8]) -> Vec<u8> {
    let (severity, bracket) = match prefix {
        "error" => (SEVERITY_ERR, false),
        "info" => (SEVERITY_INFO, false),
        "debug" => (SEVERITY_DEBUG, false),
        _ => (SEVERITY_NOTICE, true),
    };
    let pri = SYSLOG_FACILITY * 8 + severity;
    let mut msg = format!("<{pri}>{tag}: ").into_bytes();
    if bracket {
        msg.extend_from_slice(format!("[{prefix}] ").as_bytes());
    }
    let trimmed = if line.last() == Some(&b'\n') {
        &line[..line.len() - 1]
    } else {
        line
    };
    msg.extend_from_slice(trimmed);
    msg
}

impl LogWriter for SyslogWriter {
    fn open(&mut self, name: &str) -> anyhow::Result<()> {
        self.tag = name.to_string();
        self.sock = Some(SyslogWriter::dial(self.url.as_deref())?);
        Ok(())
    }

    fn write(&mut self, prefix: &str, line: &[u8]) -> anyhow::Result<()> {
        let sock = self
            .sock
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("syslog not opened"))?;
        let msg = format_syslog(&self.tag, prefix, line);
        match sock {
            SyslogSocket::Unix(s) => s.send(&msg)?,
            SyslogSocket::Udp(s) => s.send(&msg)?,
        };
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.sock = None;
        Ok(())
    }
}

// -------- none writer --------

struct NoneWriter;

impl LogWriter for NoneWriter {
    fn open(&mut self, _name: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn write(&mut self, _prefix: &str, _line: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
