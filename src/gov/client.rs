use crate::gov::governator::RecordKind;
use crate::gov::server::{decode_record, encode_args, parse_server_addr, HELP};
use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Send one command and feed every response record to the callback until the
/// `end` record. Returns false when any `err` record was received.
pub async fn call<F>(addr: &str, args: &[String], on_record: F) -> anyhow::Result<bool>
where
    F: FnMut(RecordKind, &str),
{
    let (scheme, rest) = parse_server_addr(addr)?;
    match scheme.as_str() {
        "unix" => {
            let stream = UnixStream::connect(&rest)
                .await
                .map_err(connect_error)?;
            talk(stream, args, on_record).await
        }
        "tcp" => {
            let stream = TcpStream::connect(rest.as_str())
                .await
                .map_err(connect_error)?;
            talk(stream, args, on_record).await
        }
        other => anyhow::bail!("unsupported control scheme {other:?}"),
    }
}

fn connect_error(e: std::io::Error) -> anyhow::Error {
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
            anyhow::anyhow!("governator daemon is not running")
        }
        std::io::ErrorKind::PermissionDenied => {
            anyhow::anyhow!("can't connect to governator, permission denied")
        }
        _ => anyhow::anyhow!("error connecting to daemon: {e}"),
    }
}

async fn talk<S, F>(mut stream: S, args: &[String], mut on_record: F) -> anyhow::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(RecordKind, &str),
{
    encode_args(&mut stream, args).await?;
    log::debug!("sent command {args:?}");
    let mut ok = true;
    loop {
        let (kind, text) = decode_record(&mut stream)
            .await
            .context("error decoding response")?;
        match kind {
            RecordKind::End => return Ok(ok),
            RecordKind::Ok => on_record(RecordKind::Ok, &text),
            RecordKind::Err => {
                ok = false;
                on_record(RecordKind::Err, &text);
            }
        }
    }
}

/// The one-shot client behind plain `governator <command…>` invocations.
/// `ok` records go to stdout, `err` records to stderr; the caller turns the
/// returned flag into the exit code.
pub async fn run_command(addr: &str, args: &[String]) -> anyhow::Result<bool> {
    if let Some(first) = args.first() {
        match first.to_lowercase().as_str() {
            "help" => {
                eprintln!("{HELP}");
                return Ok(true);
            }
            "exit" | "quit" => return Ok(true),
            _ => {}
        }
    }
    call(addr, args, |kind, text| match kind {
        RecordKind::Ok => print!("{text}"),
        RecordKind::Err => eprint!("{text}"),
        RecordKind::End => {}
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gov::governator::{Governator, Record};
    use crate::gov::server;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::watch;

    async fn start_server(dir: &Path) -> (Arc<Governator>, String, watch::Sender<bool>) {
        std::fs::create_dir_all(dir.join("services")).unwrap();
        let sock = dir.join("ctl.sock");
        let addr = format!("unix://{}", sock.display());
        let gov = Arc::new(Governator::new(dir, &addr, &dir.join("log")));
        gov.load_services().await.unwrap();
        let (tx, rx) = watch::channel(false);
        server::start(Arc::clone(&gov), rx).await.unwrap();
        (gov, addr, tx)
    }

    async fn collect(addr: &str, args: &[&str]) -> (bool, Vec<Record>) {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut records = Vec::new();
        let ok = call(addr, &args, |kind, text| {
            records.push(Record {
                kind,
                text: text.to_string(),
            });
        })
        .await
        .unwrap();
        (ok, records)
    }

    #[tokio::test]
    async fn list_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("services")).unwrap();
        std::fs::write(
            dir.path().join("services").join("svc.conf"),
            "command: sleep 1\nname: svc\nstart: false\nlog: none\n",
        )
        .unwrap();
        let (_gov, addr, _stop) = start_server(dir.path()).await;
        let (ok, records) = collect(&addr, &["list"]).await;
        assert!(ok);
        assert_eq!(records.len(), 1);
        assert!(records[0].text.contains("SERVICE"));
        assert!(records[0].text.contains("svc"));
        assert!(records[0].text.contains("STOPPED"));
    }

    #[tokio::test]
    async fn unknown_service_comes_back_as_err() {
        let dir = tempfile::tempdir().unwrap();
        let (_gov, addr, _stop) = start_server(dir.path()).await;
        let (ok, records) = collect(&addr, &["start", "ghost"]).await;
        assert!(!ok);
        assert!(records
            .iter()
            .any(|r| r.text.contains("no service named ghost")));
    }

    #[tokio::test]
    async fn start_and_stop_a_service_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("services")).unwrap();
        std::fs::write(
            dir.path().join("services").join("s.conf"),
            "command: sleep 50000\nname: s\nstart: false\nlog: none\n",
        )
        .unwrap();
        let (_gov, addr, _stop) = start_server(dir.path()).await;

        let (ok, records) = collect(&addr, &["start", "s"]).await;
        assert!(ok, "records: {records:?}");
        let texts: Vec<&str> = records.iter().map(|r| r.text.trim()).collect();
        assert_eq!(texts, vec!["starting s", "started s"]);

        // Starting again is a no-op success.
        let (ok, records) = collect(&addr, &["start", "s"]).await;
        assert!(ok);
        assert!(records[0].text.contains("already running"));

        let (ok, records) = collect(&addr, &["stop", "s"]).await;
        assert!(ok, "records: {records:?}");
        let texts: Vec<&str> = records.iter().map(|r| r.text.trim()).collect();
        assert_eq!(texts, vec!["stopping s", "stopped s"]);
    }

    #[tokio::test]
    async fn conf_reports_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (_gov, addr, _stop) = start_server(dir.path()).await;
        let (ok, records) = collect(&addr, &["conf", "services-dir"]).await;
        assert!(ok);
        assert!(records[0].text.trim().ends_with("services"));
        let (ok, _) = collect(&addr, &["conf", "bogus"]).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn unknown_command_mentions_help() {
        let dir = tempfile::tempdir().unwrap();
        let (_gov, addr, _stop) = start_server(dir.path()).await;
        let (ok, records) = collect(&addr, &["frobnicate"]).await;
        assert!(!ok);
        assert!(records[0].text.contains("unknown command"));
        assert!(records[0].text.contains("available commands"));
    }

    #[tokio::test]
    async fn log_command_tails_live_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("services")).unwrap();
        std::fs::write(
            dir.path().join("services").join("chatty.conf"),
            "command: sh -c 'while true; do echo tick; sleep 1; done'\n\
             name: chatty\nstart: false\nlog: none\n",
        )
        .unwrap();
        let (_gov, addr, _stop) = start_server(dir.path()).await;
        let (ok, _) = collect(&addr, &["start", "chatty"]).await;
        assert!(ok);

        // Tail until the first line arrives, then hang up.
        let (scheme, rest) = parse_server_addr(&addr).unwrap();
        assert_eq!(scheme, "unix");
        let mut stream = UnixStream::connect(&rest).await.unwrap();
        encode_args(
            &mut stream,
            &["log".to_string(), "chatty".to_string()],
        )
        .await
        .unwrap();
        let (kind, text) = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            decode_record(&mut stream),
        )
        .await
        .expect("no log line within 5s")
        .unwrap();
        assert_eq!(kind, RecordKind::Ok);
        assert!(text.contains("[stdout]"), "got {text:?}");
        assert!(text.contains("tick"), "got {text:?}");
        drop(stream);

        let (ok, _) = collect(&addr, &["stop", "chatty"]).await;
        assert!(ok);
    }
}
