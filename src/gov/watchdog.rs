use crate::gov::child::split_command;
use crate::gov::config::APP_NAME;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// One health probe bound to a service. The three kinds share a single
/// `check` entry point; a failed check makes the owning service bounce.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// Execute argv; healthy iff it exits 0.
    Run { argv: Vec<String> },
    /// Open (and immediately close) a connection.
    Connect {
        proto: String,
        addr: String,
        timeout: Duration,
    },
    /// HTTP GET; healthy iff the status is 200. The timeout covers dial
    /// through body read.
    Get { url: String, timeout: Duration },
}

fn parse_timeout(fields: &[&str], idx: usize) -> anyhow::Result<Duration> {
    match fields.get(idx) {
        None => Ok(DEFAULT_PROBE_TIMEOUT),
        Some(s) => {
            let secs: u64 = s
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid watchdog timeout {s:?}: {e}"))?;
            anyhow::ensure!(secs > 0, "watchdog timeout must be positive");
            Ok(Duration::from_secs(secs))
        }
    }
}

impl Probe {
    pub fn parse(input: &str) -> anyhow::Result<Probe> {
        let args = split_command(input)?;
        let fields: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        match fields[0] {
            "run" => {
                anyhow::ensure!(
                    fields.len() > 1,
                    "run watchdog requires at least one argument"
                );
                Ok(Probe::Run {
                    argv: args[1..].to_vec(),
                })
            }
            "connect" => {
                anyhow::ensure!(
                    fields.len() == 2 || fields.len() == 3,
                    "connect watchdog requires one or two arguments"
                );
                let target = fields[1];
                let (proto, addr) = match target.split_once("://") {
                    Some((p, a)) => (p.to_string(), a.to_string()),
                    None => ("tcp".to_string(), target.to_string()),
                };
                if proto != "unix" {
                    let valid = matches!(addr.rsplit_once(':'),
                        Some((host, port)) if !host.is_empty() && !port.is_empty());
                    anyhow::ensure!(
                        valid,
                        "address {addr:?} must specify a host and a port"
                    );
                }
                Ok(Probe::Connect {
                    proto,
                    addr,
                    timeout: parse_timeout(&fields, 2)?,
                })
            }
            "get" => {
                anyhow::ensure!(
                    fields.len() == 2 || fields.len() == 3,
                    "get watchdog requires one or two arguments"
                );
                let url = fields[1].to_string();
                anyhow::ensure!(
                    url.starts_with("http://") || url.starts_with("https://"),
                    "invalid GET URL scheme in {url:?} - must be http or https"
                );
                Ok(Probe::Get {
                    url,
                    timeout: parse_timeout(&fields, 2)?,
                })
            }
            other => anyhow::bail!(
                "invalid watchdog {other:?} - available watchdogs are run, connect and get"
            ),
        }
    }

    pub async fn check(&self) -> anyhow::Result<()> {
        match self {
            Probe::Run { argv } => {
                let status = tokio::process::Command::new(&argv[0])
                    .args(&argv[1..])
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status()
                    .await
                    .map_err(|e| anyhow::anyhow!("failed to run {:?}: {e}", argv[0]))?;
                anyhow::ensure!(
                    status.success(),
                    "exit status {}",
                    status.code().unwrap_or(-1)
                );
                Ok(())
            }
            Probe::Connect {
                proto,
                addr,
                timeout,
            } => {
                match proto.as_str() {
                    "tcp" => {
                        let conn = tokio::time::timeout(*timeout, TcpStream::connect(addr))
                            .await
                            .map_err(|_| anyhow::anyhow!("connect to {addr} timed out"))??;
                        drop(conn);
                    }
                    "unix" => {
                        let conn = tokio::time::timeout(*timeout, UnixStream::connect(addr))
                            .await
                            .map_err(|_| anyhow::anyhow!("connect to {addr} timed out"))??;
                        drop(conn);
                    }
                    other => anyhow::bail!("unsupported connect proto {other:?}"),
                }
                Ok(())
            }
            Probe::Get { url, timeout } => {
                let client = reqwest::Client::builder()
                    .timeout(*timeout)
                    .user_agent(format!("{APP_NAME} watchdog"))
                    .build()?;
                let resp = client.get(url).send().await?;
                let status = resp.status();
                anyhow::ensure!(
                    status == reqwest::StatusCode::OK,
                    "non-200 status code {}",
                    status.as_u16()
                );
                // Read the body so slow responses count against the timeout.
                let _ = resp.bytes().await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn parse_table() {
        assert_eq!(
            Probe::parse("run echo foo").unwrap(),
            Probe::Run {
                argv: vec!["echo".to_string(), "foo".to_string()]
            }
        );
        assert_eq!(
            Probe::parse("connect 127.0.0.1:80").unwrap(),
            Probe::Connect {
                proto: "tcp".to_string(),
                addr: "127.0.0.1:80".to_string(),
                timeout: DEFAULT_PROBE_TIMEOUT,
            }
        );
        assert_eq!(
            Probe::parse("connect tcp://127.0.0.1:80 5").unwrap(),
            Probe::Connect {
                proto: "tcp".to_string(),
                addr: "127.0.0.1:80".to_string(),
                timeout: Duration::from_secs(5),
            }
        );
        assert_eq!(
            Probe::parse("get http://127.0.0.1:8080/health 1").unwrap(),
            Probe::Get {
                url: "http://127.0.0.1:8080/health".to_string(),
                timeout: Duration::from_secs(1),
            }
        );
        assert!(Probe::parse("run").is_err());
        assert!(Probe::parse("connect").is_err());
        assert!(Probe::parse("connect no-port").is_err());
        assert!(Probe::parse("get ftp://host/x").is_err());
        assert!(Probe::parse("invalid").is_err());
    }

    #[tokio::test]
    async fn run_probe_checks_exit_status() {
        assert!(Probe::parse("run echo foo").unwrap().check().await.is_ok());
        let err = Probe::parse("run false").unwrap().check().await.unwrap_err();
        assert!(err.to_string().contains("exit status 1"));
        assert!(Probe::parse("run does-not-exist-xyz")
            .unwrap()
            .check()
            .await
            .is_err());
    }

    #[tokio::test]
    async fn connect_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let probe = Probe::parse(&format!("connect 127.0.0.1:{}", addr.port())).unwrap();
        assert!(probe.check().await.is_ok());

        let probe = Probe::parse("connect 127.0.0.1:1 1").unwrap();
        assert!(probe.check().await.is_err());
    }

    async fn http_once(listener: TcpListener, status_line: &'static str) {
        let (mut s, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = s.read(&mut buf).await;
        let resp = format!("{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let _ = s.write_all(resp.as_bytes()).await;
        let _ = s.shutdown().await;
    }

    #[tokio::test]
    async fn get_probe_wants_a_200() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(http_once(listener, "HTTP/1.1 200 OK"));
        let probe = Probe::parse(&format!("get http://127.0.0.1:{} 5", addr.port())).unwrap();
        assert!(probe.check().await.is_ok());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(http_once(listener, "HTTP/1.1 500 Internal Server Error"));
        let probe = Probe::parse(&format!("get http://127.0.0.1:{} 5", addr.port())).unwrap();
        let err = probe.check().await.unwrap_err();
        assert!(err.to_string().contains("non-200"), "got: {err:#}");
    }

    #[tokio::test]
    async fn get_probe_times_out_on_a_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without ever answering.
            let (s, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(s);
        });
        let probe = Probe::parse(&format!("get http://127.0.0.1:{} 1", addr.port())).unwrap();
        let started = std::time::Instant::now();
        assert!(probe.check().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
