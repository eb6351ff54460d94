//! svman - fleet control plane for hypervisor slaves

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use svman_common::telemetry::{init_telemetry, TelemetryConfig};
use svman_common::{Error, DEFAULT_MASTER_PORT, DEFAULT_SLAVE_PORT};
use svman_infra::{CertificateAuthority, SharedSecret, TrustConfig};
use svman_master::{MasterConfig, MasterServer};
use svman_slave::{SlaveConfig, SlaveNode};

/// svman - master/slave control plane for a hypervisor fleet
#[derive(Parser, Debug)]
#[command(name = "svman", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the master: accept registrations and monitor slaves
    Master(MasterArgs),

    /// Run a slave: serve commands and stay registered with the master
    Slave(SlaveArgs),

    /// Certificate helpers
    #[command(subcommand)]
    Pki(PkiCommands),
}

/// Transport trust shared by both roles
#[derive(Args, Debug)]
struct TrustArgs {
    /// PEM certificate for this node
    #[arg(long, env = "SVMAN_TLS_CERT", default_value = "/etc/svman/node.crt")]
    tls_cert: PathBuf,

    /// PEM private key for this node
    #[arg(long, env = "SVMAN_TLS_KEY", default_value = "/etc/svman/node.key")]
    tls_key: PathBuf,

    /// PEM CA bundle peers must chain to
    #[arg(long, env = "SVMAN_TLS_CA", default_value = "/etc/svman/ca.crt")]
    tls_ca: PathBuf,

    /// Identity expected on servers this node dials
    #[arg(long, env = "SVMAN_PEER_IDENTITY", default_value = "svman-node")]
    peer_identity: String,

    /// Organizational unit required on client certificates
    #[arg(long, env = "SVMAN_REQUIRED_OU", default_value = "hypervisors")]
    required_ou: String,

    /// Shared secret sent with every RPC
    #[arg(long, env = "SVMAN_SHARED_SECRET", hide_env_values = true)]
    shared_secret: String,
}

impl TrustArgs {
    fn into_config(self) -> Result<TrustConfig, Error> {
        Error::require_non_empty("shared_secret", &self.shared_secret)?;
        Error::require_non_empty("required_ou", &self.required_ou)?;
        Ok(TrustConfig {
            cert_path: self.tls_cert,
            key_path: self.tls_key,
            ca_path: self.tls_ca,
            required_org_unit: self.required_ou,
            peer_identity: self.peer_identity,
            shared_secret: SharedSecret::new(self.shared_secret),
        })
    }
}

#[derive(Args, Debug)]
struct MasterArgs {
    #[command(flatten)]
    trust: TrustArgs,

    /// Registrar listen address
    #[arg(long, env = "SVMAN_LISTEN_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_MASTER_PORT)))]
    listen: SocketAddr,

    /// Seconds between health sweeps
    #[arg(long, env = "SVMAN_PING_INTERVAL", default_value_t = 10)]
    ping_interval: u64,

    /// Re-registration attempts after evicting a slave (0 disables)
    #[arg(long, default_value_t = 3)]
    restore_attempts: u32,
}

#[derive(Args, Debug)]
struct SlaveArgs {
    #[command(flatten)]
    trust: TrustArgs,

    /// Master registrar, host[:port]
    #[arg(long, env = "SVMAN_MASTER_ADDR")]
    master: String,

    /// Logical name of this machine
    #[arg(long, env = "SVMAN_MACHINE_NAME")]
    machine_name: String,

    /// Address the master dials back to (defaults to the listen address)
    #[arg(long, env = "SVMAN_ADVERTISE_ADDR")]
    advertise: Option<String>,

    /// Command listener address
    #[arg(long, env = "SVMAN_LISTEN_ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SLAVE_PORT)))]
    listen: SocketAddr,

    /// Seconds between heartbeats to the master
    #[arg(long, env = "SVMAN_PING_INTERVAL", default_value_t = 10)]
    ping_interval: u64,
}

#[derive(Subcommand, Debug)]
enum PkiCommands {
    /// Create a fleet CA and one node certificate
    Init(PkiInitArgs),
}

#[derive(Args, Debug)]
struct PkiInitArgs {
    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// Organizational unit stamped on the node certificate
    #[arg(long, default_value = "hypervisors")]
    org_unit: String,

    /// Identity (DNS SAN) of the node certificate
    #[arg(long, default_value = "svman-node")]
    identity: String,

    /// Extra SANs (hostnames or IPs)
    #[arg(long = "san")]
    sans: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install the aws-lc-rs crypto provider");
    }

    let cli = Cli::parse();

    let service = match &cli.command {
        Commands::Master(_) => "svman-master",
        Commands::Slave(_) => "svman-slave",
        Commands::Pki(_) => "svman-pki",
    };
    init_telemetry(TelemetryConfig {
        service_name: service.to_string(),
        ..Default::default()
    })?;

    match cli.command {
        Commands::Master(args) => run_master(args).await,
        Commands::Slave(args) => run_slave(args).await,
        Commands::Pki(PkiCommands::Init(args)) => pki_init(args),
    }
}

/// Cancel the returned token on ctrl-c
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
        trigger.cancel();
    });
    token
}

fn interval_secs(field: &str, secs: u64) -> Result<Duration, Error> {
    if secs == 0 {
        return Err(Error::config(field, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let trust = args.trust.into_config()?;
    let mtls = trust.load().context("loading master trust material")?;

    let mut config = MasterConfig {
        listen_addr: args.listen,
        ..Default::default()
    };
    config.health.interval = interval_secs("ping_interval", args.ping_interval)?;
    config.health.restore_attempts = args.restore_attempts;
    config.validate()?;

    let master = MasterServer::new(&config, &mtls, trust.shared_secret.clone(), None)?;
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    master.serve(listener, shutdown_on_ctrl_c()).await?;
    Ok(())
}

async fn run_slave(args: SlaveArgs) -> anyhow::Result<()> {
    let trust = args.trust.into_config()?;
    let mtls = trust.load().context("loading slave trust material")?;

    let config = SlaveConfig {
        master_addr: args.master,
        advertise_addr: args.advertise,
        machine_name: args.machine_name,
        listen_addr: args.listen,
        heartbeat_interval: interval_secs("ping_interval", args.ping_interval)?,
        ..Default::default()
    };
    config.validate()?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let node = SlaveNode::new(config, &mtls, trust.shared_secret.clone())?;

    node.run(listener, shutdown_on_ctrl_c(), |_| {}).await?;
    Ok(())
}

fn pki_init(args: PkiInitArgs) -> anyhow::Result<()> {
    Error::require_non_empty("org_unit", &args.org_unit)?;
    Error::require_non_empty("identity", &args.identity)?;

    let ca = CertificateAuthority::new("svman fleet CA")?;
    let mut sans: Vec<&str> = vec![args.identity.as_str()];
    sans.extend(args.sans.iter().map(String::as_str));
    let node = ca.issue_node_cert(&args.identity, &args.org_unit, &sans)?;

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    write_file(&args.out.join("ca.crt"), ca.ca_cert_pem(), false)?;
    write_file(&args.out.join("ca.key"), ca.ca_key_pem(), true)?;
    write_file(&args.out.join("node.crt"), &node.cert_pem, false)?;
    write_file(&args.out.join("node.key"), node.key_pem.as_str(), true)?;

    info!(
        out = %args.out.display(),
        identity = %args.identity,
        org_unit = %args.org_unit,
        "wrote fleet CA and node certificate"
    );
    Ok(())
}

fn write_file(path: &Path, contents: &str, private: bool) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    if private {
        restrict_to_owner(path).with_context(|| format!("restricting {}", path.display()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn slave_args_parse() {
        let cli = Cli::try_parse_from([
            "svman",
            "slave",
            "--master",
            "10.0.0.1",
            "--machine-name",
            "worker-1",
            "--shared-secret",
            "s3cret",
        ])
        .expect("slave args should parse");
        match cli.command {
            Commands::Slave(args) => {
                assert_eq!(args.master, "10.0.0.1");
                assert_eq!(args.listen.port(), 50052);
                assert_eq!(args.trust.required_ou, "hypervisors");
            }
            other => panic!("expected slave command, got {:?}", other),
        }
    }

    #[test]
    fn empty_secret_is_rejected() {
        let trust = TrustArgs {
            tls_cert: "a".into(),
            tls_key: "b".into(),
            tls_ca: "c".into(),
            peer_identity: "svman-node".to_string(),
            required_ou: "hypervisors".to_string(),
            shared_secret: "  ".to_string(),
        };
        let err = trust.into_config().expect_err("empty secret");
        assert!(err.to_string().contains("shared_secret"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(interval_secs("ping_interval", 0).is_err());
        assert_eq!(
            interval_secs("ping_interval", 3).expect("valid"),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn pki_init_writes_loadable_material() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("pki");
        pki_init(PkiInitArgs {
            out: dir.clone(),
            org_unit: "hypervisors".to_string(),
            identity: "svman-node".to_string(),
            sans: vec!["127.0.0.1".to_string()],
        })
        .expect("pki init");

        let trust = TrustConfig {
            cert_path: dir.join("node.crt"),
            key_path: dir.join("node.key"),
            ca_path: dir.join("ca.crt"),
            required_org_unit: "hypervisors".to_string(),
            peer_identity: "svman-node".to_string(),
            shared_secret: SharedSecret::new("s3cret"),
        };
        trust.load().expect("written material should load");
    }
}
