//! Master and slaves talking over loopback mTLS

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use svman_common::BackoffPolicy;
use svman_infra::{CertificateAuthority, Dialer, MtlsConfig, SharedSecret};
use svman_master::{HealthPolicy, MasterConfig, MasterServer, NodeChannels, SharedNodeRegistry};
use svman_proto::command_listener_client::CommandListenerClient;
use svman_proto::registrar_client::RegistrarClient;
use svman_proto::{HeartbeatRequest, RegisterRequest};
use svman_slave::{CommandServer, SlaveConfig, SlaveNode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const IDENTITY: &str = "svman-node";
const ORG_UNIT: &str = "hypervisors";
const SECRET: &str = "fleet-secret";

struct Fleet {
    ca: CertificateAuthority,
}

impl Fleet {
    fn new() -> Self {
        Self {
            ca: CertificateAuthority::new("svman test CA").expect("ca"),
        }
    }

    fn trust(&self, name: &str, org_unit: &str) -> MtlsConfig {
        let cert = self
            .ca
            .issue_node_cert(name, org_unit, &[IDENTITY, "127.0.0.1"])
            .expect("node cert");
        MtlsConfig::from_pem(
            &cert.cert_pem,
            cert.key_pem.as_str(),
            self.ca.ca_cert_pem(),
            ORG_UNIT,
            IDENTITY,
        )
        .expect("mtls config")
    }
}

struct RunningMaster {
    addr: SocketAddr,
    registry: SharedNodeRegistry,
    channels: Arc<dyn NodeChannels>,
}

fn fast_health() -> HealthPolicy {
    HealthPolicy {
        interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(500),
        attempts: 3,
        retry_delay: Duration::from_millis(100),
        restore_attempts: 0,
        restore_delay: Duration::from_millis(100),
    }
}

async fn start_master(fleet: &Fleet, shutdown: &CancellationToken) -> RunningMaster {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind master");
    let addr = listener.local_addr().expect("master addr");
    let config = MasterConfig {
        listen_addr: addr,
        health: fast_health(),
        dial_timeout: Duration::from_secs(5),
    };
    let master = MasterServer::new(
        &config,
        &fleet.trust("master", ORG_UNIT),
        SharedSecret::new(SECRET),
        None,
    )
    .expect("master");

    let running = RunningMaster {
        addr,
        registry: master.registry(),
        channels: master.node_channels(),
    };
    tokio::spawn(master.serve(listener, shutdown.clone()));
    running
}

fn slave_config(master: SocketAddr, name: &str) -> SlaveConfig {
    SlaveConfig {
        master_addr: master.to_string(),
        machine_name: name.to_string(),
        heartbeat_interval: Duration::from_millis(500),
        heartbeat_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(5),
        register_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2,
        },
        ..Default::default()
    }
}

/// Start a full slave; returns the address its command listener is bound to
async fn start_slave(
    config: SlaveConfig,
    trust: &MtlsConfig,
    secret: &str,
    shutdown: &CancellationToken,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind slave");
    let addr = listener.local_addr().expect("slave addr");
    let node = SlaveNode::new(config, trust, SharedSecret::new(secret)).expect("slave");
    let token = shutdown.clone();
    tokio::spawn(async move { node.run(listener, token, |_| {}).await });
    addr
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// =============================================================================
// Fresh registration
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slave_registers_and_channel_is_usable() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    let slave_addr = start_slave(
        slave_config(master.addr, "worker-1"),
        &fleet.trust("worker-1", ORG_UNIT),
        SECRET,
        &shutdown,
    )
    .await;

    let registry = master.registry.clone();
    wait_until("worker-1 to register", Duration::from_secs(10), || {
        registry.get_by_machine_name("worker-1").is_some()
    })
    .await;

    let entry = master
        .registry
        .get_by_machine_name("worker-1")
        .expect("registered");
    assert_eq!(entry.address, slave_addr.to_string());
    assert_eq!(master.channels.machine_names(), vec!["worker-1"]);

    // Feature subsystems reach the slave through the registry's channel
    let channel = master.channels.channel_for("worker-1").expect("live channel");
    let ack = CommandListenerClient::new(channel)
        .heartbeat(HeartbeatRequest {
            text: "ping to slave worker-1".to_string(),
        })
        .await
        .expect("heartbeat over registry channel")
        .into_inner();
    assert_eq!(ack.ok, "OK from slave");

    // Active health checks keep the entry and advance last-seen
    let first_seen = entry.last_seen;
    let registry = master.registry.clone();
    wait_until("a successful probe", Duration::from_secs(5), || {
        registry
            .get_by_machine_name("worker-1")
            .map(|e| e.last_seen > first_seen)
            .unwrap_or(false)
    })
    .await;

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_machine_is_not_connected() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    let err = master
        .channels
        .channel_for("worker-9")
        .expect_err("nothing registered");
    assert_eq!(err.to_string(), "machine 'worker-9' is not connected");

    shutdown.cancel();
}

// =============================================================================
// Replacement
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_registration_replaces_entry() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    // Only the command listener; registrations are sent by hand
    let trust = fleet.trust("worker-1", ORG_UNIT);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let slave_addr = listener.local_addr().expect("addr");
    let server = CommandServer::new(&trust, SharedSecret::new(SECRET)).expect("server");
    server
        .start(listener, shutdown.clone(), |_| {})
        .expect("listener start");

    let to_master = Dialer::new(&trust, SharedSecret::new(SECRET))
        .expect("dialer")
        .dial(&master.addr.to_string())
        .await
        .expect("dial master");
    let mut client = RegistrarClient::new(to_master.authenticated());
    let request = || RegisterRequest {
        address: slave_addr.to_string(),
        machine_name: "worker-1".to_string(),
    };

    client.register(request()).await.expect("first registration");
    let first = master
        .registry
        .get_by_machine_name("worker-1")
        .expect("first entry");

    client.register(request()).await.expect("replayed registration");
    let second = master
        .registry
        .get_by_machine_name("worker-1")
        .expect("second entry");

    assert!(second.generation > first.generation);
    assert!(first.channel.is_closed());
    assert!(!second.channel.is_closed());
    assert_eq!(master.registry.len(), 1);

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_machine_name_is_invalid() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    let to_master = Dialer::new(&fleet.trust("worker-1", ORG_UNIT), SharedSecret::new(SECRET))
        .expect("dialer")
        .dial(&master.addr.to_string())
        .await
        .expect("dial master");
    let status = RegistrarClient::new(to_master.authenticated())
        .register(RegisterRequest {
            address: "127.0.0.1:1".to_string(),
            machine_name: String::new(),
        })
        .await
        .expect_err("empty name must be rejected");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    shutdown.cancel();
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_slave_is_evicted() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    let trust = fleet.trust("worker-1", ORG_UNIT);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let slave_addr = listener.local_addr().expect("addr");
    let slave_stop = CancellationToken::new();
    let server = CommandServer::new(&trust, SharedSecret::new(SECRET)).expect("server");
    let serving = server
        .start(listener, slave_stop.clone(), |_| {})
        .expect("listener start");

    let to_master = Dialer::new(&trust, SharedSecret::new(SECRET))
        .expect("dialer")
        .dial(&master.addr.to_string())
        .await
        .expect("dial master");
    RegistrarClient::new(to_master.authenticated())
        .register(RegisterRequest {
            address: slave_addr.to_string(),
            machine_name: "worker-1".to_string(),
        })
        .await
        .expect("registration");
    let entry = master
        .registry
        .get_by_machine_name("worker-1")
        .expect("registered");

    // The slave goes away for good
    slave_stop.cancel();
    let _ = serving.await;

    let registry = master.registry.clone();
    wait_until("eviction", Duration::from_secs(10), || registry.is_empty()).await;
    assert!(entry.channel.is_closed());
    assert!(master.channels.channel_for("worker-1").is_err());

    shutdown.cancel();
}

// =============================================================================
// Trust rejection
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slave_without_org_unit_is_refused() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    // Same CA, but the leaf carries no organizational unit
    let outsider = fleet.trust("outsider", "");
    let dialed = Dialer::new(&outsider, SharedSecret::new(SECRET))
        .expect("dialer")
        .dial(&master.addr.to_string())
        .await;

    // TLS 1.3 clients can finish before the server rejects them, so the
    // refusal shows up either at dial or at the first call
    if let Ok(channel) = dialed {
        let registered = RegistrarClient::new(channel.authenticated())
            .register(RegisterRequest {
                address: "127.0.0.1:1".to_string(),
                machine_name: "outsider".to_string(),
            })
            .await;
        assert!(registered.is_err());
    }

    start_slave(
        slave_config(master.addr, "outsider"),
        &outsider,
        SECRET,
        &shutdown,
    )
    .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(master.registry.is_empty());

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_secret_is_unauthenticated() {
    let fleet = Fleet::new();
    let shutdown = CancellationToken::new();
    let master = start_master(&fleet, &shutdown).await;

    let to_master = Dialer::new(&fleet.trust("worker-1", ORG_UNIT), SharedSecret::new("guess"))
        .expect("dialer")
        .dial(&master.addr.to_string())
        .await
        .expect("transport is fine");
    let status = RegistrarClient::new(to_master.authenticated())
        .register(RegisterRequest {
            address: "127.0.0.1:1".to_string(),
            machine_name: "worker-1".to_string(),
        })
        .await
        .expect_err("wrong secret must be refused");
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert!(master.registry.is_empty());

    shutdown.cancel();
}
