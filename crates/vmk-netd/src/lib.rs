//! Control daemon for the virtual switch.
//!
//! Builds a [`Net`] context from a TOML file and serves the line protocol of
//! [`vmk_net::control`] over any async reader/writer pair, stdin/stdout in
//! the shipped binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use vmk_net::control::{self, Reply};
use vmk_net::{Config, Net};

/// Virtual switch control daemon
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "vmk-netd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    pub log_level: Option<String>,

    /// Skip the legacy hub and bond pairs
    #[arg(long)]
    pub no_legacy: bool,
}

impl Cli {
    /// Loads the configuration named on the command line, or the defaults.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => Config::default(),
        };
        if self.no_legacy {
            config.net.legacy_bonds = false;
        }
        Ok(config)
    }

    /// Filter directive in effect: command line first, then the config.
    pub fn log_level<'a>(&'a self, config: &'a Config) -> &'a str {
        self.log_level.as_deref().unwrap_or(&config.logging.level)
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log filter '{level}'"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}

/// Builds the switch described by `config`.
pub fn startup(config: &Config) -> Result<Arc<Net>> {
    let net = config.build().context("building switch topology")?;
    for info in net.portset_info() {
        debug!(portset = %info.name, index = info.index, ports = info.num_ports, "portset ready");
    }
    info!(
        portsets = net.portset_info().len(),
        bonds = net.bond_names().len(),
        "switch topology built"
    );
    Ok(Arc::new(net))
}

/// Serves the control protocol for one session.
pub struct ControlServer {
    net: Arc<Net>,
}

impl ControlServer {
    pub fn new(net: Arc<Net>) -> Self {
        Self { net }
    }

    pub fn net(&self) -> &Arc<Net> {
        &self.net
    }

    /// Runs one request. Switch operations are synchronous and take locks,
    /// so they run on the blocking pool.
    pub async fn handle(&self, line: String) -> Result<Reply> {
        let net = Arc::clone(&self.net);
        tokio::task::spawn_blocking(move || control::handle_line(&net, &line))
            .await
            .context("control request panicked")
    }

    /// Reads requests until end of input or `quit`, writing one reply per
    /// request. Blank lines and `#` comments are skipped. Returns the number
    /// of requests served.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut served = 0;
        while let Some(line) = lines.next_line().await.context("reading request")? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "quit" || line == "exit" {
                debug!("session closed by client");
                break;
            }
            let reply = self.handle(line.to_string()).await?;
            if !reply.status.is_ok() {
                warn!(request = line, status = %reply.status, "request failed");
            }
            writer
                .write_all(reply.to_string().as_bytes())
                .await
                .context("writing reply")?;
            writer.flush().await.context("flushing reply")?;
            served += 1;
        }
        Ok(served)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["vmk-netd", "--config", "/etc/vmk-netd.toml", "-l", "debug", "--no-legacy"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vmk-netd.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.no_legacy);

        let cli = Cli::parse_from(["vmk-netd"]);
        assert_eq!(cli.config, None);
        assert!(!cli.no_legacy);
    }

    #[test]
    fn test_log_level_precedence() {
        let mut config = Config::default();
        config.logging.level = "warn".into();
        let cli = Cli::parse_from(["vmk-netd"]);
        assert_eq!(cli.log_level(&config), "warn");
        let cli = Cli::parse_from(["vmk-netd", "--log-level", "trace"]);
        assert_eq!(cli.log_level(&config), "trace");
    }

    #[test]
    fn test_no_legacy_overrides_config() {
        let cli = Cli::parse_from(["vmk-netd", "--no-legacy"]);
        let config = cli.load_config().unwrap();
        assert!(!config.net.legacy_bonds);
        assert!(Cli::parse_from(["vmk-netd"]).load_config().unwrap().net.legacy_bonds);
    }

    #[tokio::test]
    async fn test_serve_session() {
        let mut config = Config::default();
        config.net.legacy_bonds = false;
        let server = ControlServer::new(startup(&config).unwrap());
        let input = b"# comment\n\ncreate hub0 8 hub\nlist\ndestroy nope\nquit\ncreate late 8 hub\n";
        let mut output = Vec::new();
        let served = server.serve(&input[..], &mut output).await.unwrap();
        assert_eq!(served, 3);

        let text = String::from_utf8(output).unwrap();
        let statuses: Vec<&str> = text
            .lines()
            .filter(|l| ["OK", "NOT_FOUND"].iter().any(|s| l.starts_with(s)))
            .map(|l| l.split(' ').next().unwrap_or_default())
            .collect();
        assert_eq!(statuses, vec!["OK", "OK", "NOT_FOUND"]);
        assert!(server.net().portset_info().iter().all(|i| i.name != "late"));
    }
}
