use crate::gov::config::APP_NAME;
use crate::gov::governator::{Governator, RecordKind, Reply};
use crate::gov::service::{ServiceSnapshot, State};
use anyhow::Context as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

pub const HELP: &str = "available commands are:
    start <service>   : starts a service
    stop <service>    : stops a service
    restart <service> : restart
    list              : list registered services
    log <service>     : tail a running service's log
    conf <param>      : show config-dir or services-dir
    wait-for <file>   : wait until a service file registers
    exit              : close the shell
    help              : show help";

// Refuse absurd lengths instead of allocating whatever a broken client
// claims.
const MAX_STRING: u32 = 1 << 20;

// -------- wire codec: u32 big-endian lengths, tagged response records --------

pub async fn encode_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> anyhow::Result<()> {
    w.write_u32(s.len() as u32).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

pub async fn decode_string<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<String> {
    let len = r.read_u32().await?;
    anyhow::ensure!(len <= MAX_STRING, "string length {len} exceeds limit");
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

pub async fn encode_args<W: AsyncWrite + Unpin>(w: &mut W, args: &[String]) -> anyhow::Result<()> {
    w.write_u32(args.len() as u32).await?;
    for a in args {
        encode_string(w, a).await?;
    }
    w.flush().await?;
    Ok(())
}

pub async fn decode_args<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Vec<String>> {
    let count = r.read_u32().await?;
    anyhow::ensure!(count <= 1024, "argument count {count} exceeds limit");
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(decode_string(r).await?);
    }
    Ok(args)
}

fn record_tag(kind: RecordKind) -> u8 {
    match kind {
        RecordKind::End => 0,
        RecordKind::Ok => 1,
        RecordKind::Err => 2,
    }
}

pub async fn encode_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: RecordKind,
    text: &str,
) -> anyhow::Result<()> {
    w.write_u8(record_tag(kind)).await?;
    encode_string(w, text).await?;
    w.flush().await?;
    Ok(())
}

pub async fn decode_record<R: AsyncRead + Unpin>(
    r: &mut R,
) -> anyhow::Result<(RecordKind, String)> {
    let tag = r.read_u8().await?;
    let kind = match tag {
        0 => RecordKind::End,
        1 => RecordKind::Ok,
        2 => RecordKind::Err,
        other => anyhow::bail!("invalid response type {other}"),
    };
    let s = decode_string(r).await?;
    Ok((kind, s))
}

// -------- listener --------

pub fn parse_server_addr(addr: &str) -> anyhow::Result<(String, String)> {
    let (scheme, rest) = addr
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("invalid server address {addr:?} (want scheme://addr)"))?;
    anyhow::ensure!(!rest.is_empty(), "empty address in {addr:?}");
    Ok((scheme.to_string(), rest.to_string()))
}

enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

fn chown_socket(path: &Path) {
    // The operator group may connect; everyone else only via root.
    if let Some(group) = users::get_group_by_name(APP_NAME) {
        let gid = nix::unistd::Gid::from_raw(group.gid());
        if let Err(e) = nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(0)), Some(gid)) {
            log::debug!("cannot chown {}: {e}", path.display());
        }
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o775)) {
            log::debug!("cannot chmod {}: {e}", path.display());
        }
    }
}

/// Bind the control socket and spawn the accept loop. One task per
/// connection; connection errors are logged and close only that connection.
pub async fn start(gov: Arc<Governator>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let (scheme, rest) = parse_server_addr(gov.server_addr())?;
    let listener = match scheme.as_str() {
        "unix" => {
            let path = PathBuf::from(&rest);
            let _ = std::fs::remove_file(&path);
            let l = UnixListener::bind(&path)
                .with_context(|| format!("binding {}", path.display()))?;
            chown_socket(&path);
            Listener::Unix(l, path)
        }
        "tcp" => {
            let l = TcpListener::bind(&rest)
                .await
                .with_context(|| format!("binding {rest}"))?;
            Listener::Tcp(l)
        }
        other => anyhow::bail!("unsupported control scheme {other:?}"),
    };
    tokio::spawn(async move {
        loop {
            match &listener {
                Listener::Unix(l, _) => {
                    tokio::select! {
                        r = l.accept() => accept_unix(&gov, r),
                        _ = shutdown.changed() => break,
                    }
                }
                Listener::Tcp(l) => {
                    tokio::select! {
                        r = l.accept() => accept_tcp(&gov, r),
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        if let Listener::Unix(_, path) = &listener {
            let _ = std::fs::remove_file(path);
        }
    });
    Ok(())
}

fn accept_unix(
    gov: &Arc<Governator>,
    r: std::io::Result<(UnixStream, tokio::net::unix::SocketAddr)>,
) {
    match r {
        Ok((stream, _)) => {
            let gov = Arc::clone(gov);
            tokio::spawn(async move {
                if let Err(e) = serve_conn(gov, stream).await {
                    log::error!("error serving connection: {e:#}");
                }
            });
        }
        Err(e) => log::error!("error accepting connection: {e}"),
    }
}

fn accept_tcp(gov: &Arc<Governator>, r: std::io::Result<(TcpStream, std::net::SocketAddr)>) {
    match r {
        Ok((stream, _)) => {
            let gov = Arc::clone(gov);
            tokio::spawn(async move {
                if let Err(e) = serve_conn(gov, stream).await {
                    log::error!("error serving connection: {e:#}");
                }
            });
        }
        Err(e) => log::error!("error accepting connection: {e}"),
    }
}

// -------- per-connection dispatch --------

async fn serve_conn<S>(gov: Arc<Governator>, mut stream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let args = decode_args(&mut stream)
        .await
        .map_err(|e| anyhow::anyhow!("error decoding arguments: {e:#}"))?;
    if args.is_empty() {
        return encode_record(&mut stream, RecordKind::End, "").await;
    }
    let cmd = args[0].to_lowercase();
    match cmd.as_str() {
        "start" | "stop" | "restart" => {
            if args.len() != 2 {
                encode_record(
                    &mut stream,
                    RecordKind::Err,
                    &format!("command {cmd} requires exactly one argument\n"),
                )
                .await?;
            } else {
                let target = args[1].clone();
                let op_cmd = cmd.clone();
                let (tx, mut rx) = mpsc::unbounded_channel();
                let reply = Reply::new(tx);
                let gov2 = Arc::clone(&gov);
                let op = tokio::spawn(async move {
                    match op_cmd.as_str() {
                        "start" => gov2.cmd_start(&target, &reply).await,
                        "stop" => gov2.cmd_stop(&target, &reply).await,
                        _ => gov2.cmd_restart(&target, &reply).await,
                    }
                });
                while let Some(rec) = rx.recv().await {
                    encode_record(&mut stream, rec.kind, &rec.text).await?;
                }
                op.await
                    .map_err(|e| anyhow::anyhow!("operation task failed: {e}"))?;
            }
        }
        "list" => {
            let table = render_list(&gov.snapshots().await);
            encode_record(&mut stream, RecordKind::Ok, &table).await?;
        }
        "log" => {
            if args.len() != 2 {
                encode_record(
                    &mut stream,
                    RecordKind::Err,
                    "command log requires exactly one argument\n",
                )
                .await?;
            } else {
                return serve_log(gov, stream, &args[1]).await;
            }
        }
        "conf" => {
            if args.len() != 2 {
                encode_record(
                    &mut stream,
                    RecordKind::Err,
                    &format!("conf requires one argument, {} given", args.len() - 1),
                )
                .await?;
            } else {
                let value = match args[1].to_lowercase().as_str() {
                    "config-dir" => Some(gov.config_dir().to_path_buf()),
                    "services-dir" => Some(gov.services_dir()),
                    _ => None,
                };
                match value {
                    Some(p) => {
                        let abs = std::path::absolute(&p).unwrap_or(p);
                        encode_record(
                            &mut stream,
                            RecordKind::Ok,
                            &format!("{}\n", abs.display()),
                        )
                        .await?;
                    }
                    None => {
                        encode_record(
                            &mut stream,
                            RecordKind::Err,
                            &format!("unknown configuration parameter {:?}", args[1]),
                        )
                        .await?;
                    }
                }
            }
        }
        "wait-for" => {
            if args.len() != 2 {
                encode_record(
                    &mut stream,
                    RecordKind::Err,
                    &format!("wait-for requires one argument, {} given", args.len() - 1),
                )
                .await?;
            } else if gov.wait_for_file(&args[1]).await {
                encode_record(&mut stream, RecordKind::Ok, "").await?;
            } else {
                encode_record(
                    &mut stream,
                    RecordKind::Err,
                    &format!("service {} not found after waiting 10s", args[1]),
                )
                .await?;
            }
        }
        "help" => {
            encode_record(&mut stream, RecordKind::Ok, &format!("{HELP}\n")).await?;
        }
        _ => {
            encode_record(
                &mut stream,
                RecordKind::Err,
                &format!("unknown command {cmd} - {HELP}\n"),
            )
            .await?;
        }
    }
    encode_record(&mut stream, RecordKind::End, "").await
}

/// Attach a monitor to the service's log sink and stream lines until the
/// client sends anything (or disconnects).
async fn serve_log<S>(gov: Arc<Governator>, stream: S, name: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let (logger, state) = match gov.service_logger(name).await {
        Some(v) => v,
        None => {
            encode_record(&mut wr, RecordKind::Err, &format!("no service named {name}\n")).await?;
            return encode_record(&mut wr, RecordKind::End, "").await;
        }
    };
    if state != State::Started {
        encode_record(&mut wr, RecordKind::Err, &format!("{name} is not running\n")).await?;
        return encode_record(&mut wr, RecordKind::End, "").await;
    }
    if logger.has_monitor() {
        encode_record(
            &mut wr,
            RecordKind::Err,
            &format!("{name} is already being monitored\n"),
        )
        .await?;
        return encode_record(&mut wr, RecordKind::End, "").await;
    }
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    logger.set_monitor(Some(Box::new(move |prefix, b| {
        let mut line = format!("[{prefix}] ");
        line.push_str(&String::from_utf8_lossy(b));
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let _ = tx.send(line);
    })));
    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    if encode_record(&mut wr, RecordKind::Ok, &line).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            // The tail stops when the client sends something over the
            // connection or closes it.
            _ = rd.read(&mut byte) => break,
        }
    }
    logger.set_monitor(None);
    encode_record(&mut wr, RecordKind::End, "").await
}

// -------- list rendering --------

fn status_line(s: &ServiceSnapshot) -> String {
    match s.state {
        State::Started => {
            let since = s
                .started
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            if s.restarts > 0 {
                format!("RUNNING since {since} - {} restarts", s.restarts)
            } else {
                format!("RUNNING since {since}")
            }
        }
        State::Backoff => {
            let err = s.err.as_deref().unwrap_or("-");
            let next = s
                .next_start_in
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "-".to_string());
            format!("BACKOFF - {err} - next retry in {next}")
        }
        State::Failed => format!("FAILED - {}", s.err.as_deref().unwrap_or("-")),
        st => st.as_str().to_string(),
    }
}

pub fn render_list(snaps: &[ServiceSnapshot]) -> String {
    let mut rows: Vec<(String, String)> = vec![("SERVICE".to_string(), "STATUS".to_string())];
    for s in snaps {
        rows.push((s.name.clone(), status_line(s)));
    }
    let width = rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0) + 4;
    let mut out = String::new();
    for (name, status) in rows {
        out.push_str(&name);
        out.push_str(&" ".repeat(width - name.len()));
        out.push_str(&status);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn codec_round_trips_args_and_records() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let args = vec!["start".to_string(), "redis".to_string()];
        encode_args(&mut a, &args).await.unwrap();
        assert_eq!(decode_args(&mut b).await.unwrap(), args);

        encode_record(&mut a, RecordKind::Ok, "starting redis\n")
            .await
            .unwrap();
        encode_record(&mut a, RecordKind::Err, "boom").await.unwrap();
        encode_record(&mut a, RecordKind::End, "").await.unwrap();
        assert_eq!(
            decode_record(&mut b).await.unwrap(),
            (RecordKind::Ok, "starting redis\n".to_string())
        );
        assert_eq!(
            decode_record(&mut b).await.unwrap(),
            (RecordKind::Err, "boom".to_string())
        );
        assert_eq!(
            decode_record(&mut b).await.unwrap(),
            (RecordKind::End, String::new())
        );
    }

    #[tokio::test]
    async fn wire_format_is_big_endian_length_prefixed() {
        let (mut a, mut b) = tokio::io::duplex(256);
        encode_args(&mut a, &["list".to_string()]).await.unwrap();
        drop(a);
        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert_eq!(
            raw,
            vec![0, 0, 0, 1, 0, 0, 0, 4, b'l', b'i', b's', b't']
        );
    }

    #[tokio::test]
    async fn decode_rejects_oversized_strings() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_u32(u32::MAX).await.unwrap();
        assert!(decode_string(&mut b).await.is_err());
    }

    #[test]
    fn parse_addr_schemes() {
        assert_eq!(
            parse_server_addr("unix:///tmp/g.sock").unwrap(),
            ("unix".to_string(), "/tmp/g.sock".to_string())
        );
        assert_eq!(
            parse_server_addr("tcp://127.0.0.1:9000").unwrap(),
            ("tcp".to_string(), "127.0.0.1:9000".to_string())
        );
        assert!(parse_server_addr("/tmp/g.sock").is_err());
        assert!(parse_server_addr("unix://").is_err());
    }

    #[test]
    fn list_renders_a_table() {
        let snaps = vec![
            ServiceSnapshot {
                name: "redis".to_string(),
                file: "redis.conf".to_string(),
                state: State::Stopped,
                started: None,
                restarts: 0,
                err: None,
                retries: 0,
                next_start_in: None,
                pid: None,
                auto_start: true,
                priority: 1,
            },
            ServiceSnapshot {
                name: "web".to_string(),
                file: "web.conf".to_string(),
                state: State::Failed,
                started: None,
                restarts: 0,
                err: Some("maximum retries reached".to_string()),
                retries: 10,
                next_start_in: None,
                pid: None,
                auto_start: true,
                priority: 2,
            },
        ];
        let out = render_list(&snaps);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("SERVICE"));
        assert!(lines[1].starts_with("redis"));
        assert!(lines[1].contains("STOPPED"));
        assert!(lines[2].contains("FAILED - maximum retries reached"));
    }
}
