use crate::gov::build_info;
use crate::gov::client;
use crate::gov::config::{
    default_config_dir, default_log_dir, default_server_addr, parse_configs, APP_NAME,
};
use crate::gov::governator::Governator;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "governator", about = "user-space process supervisor", disable_version_flag = true)]
pub struct Args {
    /// Run in daemon mode (requires root)
    #[arg(short = 'D')]
    pub daemon_mode: bool,

    /// Enable debug logging
    #[arg(short = 'd')]
    pub debug: bool,

    /// Parse and validate configuration files, then exit
    #[arg(short = 't')]
    pub test_config: bool,

    /// Configuration directory; service files live in <dir>/services
    #[arg(short = 'c', long = "config", default_value_t = default_config_dir())]
    pub config_dir: String,

    /// Daemon URL to listen on in daemon mode or to connect to in client mode
    #[arg(long = "daemon", value_name = "SCHEME://ADDR", default_value_t = default_server_addr())]
    pub server_addr: String,

    /// Directory for per-service log files
    #[arg(long = "log-dir", default_value_t = default_log_dir())]
    pub log_dir: String,

    /// Print version and exit
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    /// Command for the built-in client (e.g. `list` or `start redis`)
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

fn test_configurations(config_dir: &Path) -> anyhow::Result<i32> {
    let configs = parse_configs(&config_dir.join("services"))?;
    let mut ok = true;
    for cfg in &configs {
        println!("checking {}", cfg.service_name());
        if let Some(err) = &cfg.err {
            eprintln!("error in {}: {err}", cfg.service_name());
            ok = false;
        }
    }
    if ok {
        println!("configurations OK");
    }
    Ok(if ok { 0 } else { 1 })
}

/// Parse flags and dispatch: version banner, config test, daemon, or the
/// built-in client. Returns the process exit code.
pub async fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let level = if args.debug {
        log::Level::Debug
    } else {
        log::Level::Info
    };
    let _ = simple_logger::init_with_level(level);

    if args.version {
        println!("{}", build_info::banner());
        return Ok(0);
    }
    if args.test_config {
        return test_configurations(Path::new(&args.config_dir));
    }
    if args.daemon_mode {
        let gov = Arc::new(Governator::new(
            Path::new(&args.config_dir),
            &args.server_addr,
            Path::new(&args.log_dir),
        ));
        gov.run().await?;
        return Ok(0);
    }
    anyhow::ensure!(
        !args.command.is_empty(),
        "no command given (try `{APP_NAME} help`)"
    );
    let ok = client::run_command(&args.server_addr, &args.command).await?;
    Ok(if ok { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_command_is_positional() {
        let args = Args::try_parse_from(["governator", "-c", "/etc/g", "start", "redis"]).unwrap();
        assert!(!args.daemon_mode);
        assert_eq!(args.config_dir, "/etc/g");
        assert_eq!(args.command, vec!["start", "redis"]);
    }

    #[test]
    fn daemon_flags_parse() {
        let args = Args::try_parse_from([
            "governator",
            "-D",
            "-d",
            "--daemon",
            "unix:///run/g.sock",
        ])
        .unwrap();
        assert!(args.daemon_mode);
        assert!(args.debug);
        assert_eq!(args.server_addr, "unix:///run/g.sock");
        assert!(args.command.is_empty());
    }

    #[test]
    fn defaults_point_at_etc_and_tmp() {
        let args = Args::try_parse_from(["governator", "list"]).unwrap();
        assert_eq!(args.config_dir, "/etc/governator");
        assert_eq!(args.server_addr, "unix:///tmp/governator.sock");
        assert_eq!(args.log_dir, "/var/log/governator");
    }
}
