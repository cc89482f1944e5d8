#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Amunchain validator-endpoint announcer entrypoint (systemd-friendly).
//! Bootstraps the keystore, durable tables, libp2p transport, metrics/health
//! HTTP surface, and the announce loop, then waits for a shutdown signal.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{error, info, warn};

use valannounce::config::NodeConfig;
use valannounce::consensus_iface::{AnnounceConsensusAdapter, ConsensusProvider, StaticConsensusProvider};
use valannounce::core::types::Address;
use valannounce::core::crypto::Signer;
use valannounce::core::security::keystore::{FileSecp256k1Backend, Keystore};
use valannounce::monitoring::{http as metrics_http, metrics::Metrics};
use valannounce::networking::peer_registry::{load_and_verify_peer_registry_now, PeerRegistryPolicy};
use valannounce::networking::transport::{Libp2pAnnounceTransport, TransportConfig};
use valannounce::protocol::endpoint_table::EndpointTable;
use valannounce::protocol::version_table::VersionTable;
use valannounce::protocol::announce_loop;
use valannounce::storage::kv::SledKvStore;

const DB_SCHEMA_VERSION: u32 = 1;

fn resolve_allow_peers(cfg: &NodeConfig) -> Vec<String> {
    let Some(registry) = &cfg.peer_registry else {
        return cfg.p2p.allow_peers.clone();
    };
    let policy =
        PeerRegistryPolicy { expected_network: Some(registry.network.as_str()), ..PeerRegistryPolicy::default_with_now(0) };
    match load_and_verify_peer_registry_now(&registry.path, &registry.pubkey_hex, &policy) {
        Ok(peers) => peers,
        Err(e) => {
            warn!(?e, path = %registry.path, "peer registry verification failed; falling back to static allowlist");
            cfg.p2p.allow_peers.clone()
        }
    }
}

fn self_node_url(signer: &dyn Signer, cfg: &NodeConfig) -> Option<String> {
    let port = cfg.p2p.listen_port()?;
    Some(format!("enode://{}@{}:{}", hex::encode(signer.public_key().0), cfg.p2p.external_host, port))
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt().with_target(false).with_level(true).compact().try_init();

    let cfg = match std::env::var("AMUN_CONFIG") {
        Ok(path) => NodeConfig::load(&path).unwrap_or_else(|e| {
            error!(?e, %path, "failed to load config file; falling back to env-only defaults");
            NodeConfig::from_env()
        }),
        Err(_) => NodeConfig::from_env(),
    };

    info!(name = %cfg.node.name, data_dir = %cfg.node.data_dir, "amunchain announcer starting");

    if let Err(e) = std::fs::create_dir_all(&cfg.node.data_dir) {
        error!(?e, "failed to create data dir");
        std::process::exit(1);
    }

    let keystore = match Keystore::<FileSecp256k1Backend>::open(&cfg.node.data_dir) {
        Ok(ks) => Arc::new(ks),
        Err(e) => {
            error!(?e, "failed to open keystore");
            std::process::exit(1);
        }
    };
    let signer: Arc<dyn Signer> = keystore.clone();
    let self_address = keystore.address();
    info!(address = %self_address, "validator identity loaded");

    let metrics = match Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!(?e, "failed to construct metrics registry");
            std::process::exit(1);
        }
    };

    let db_path = Path::new(&cfg.node.data_dir).join("announce_db");
    let kv = match SledKvStore::open(&db_path, DB_SCHEMA_VERSION, None) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(?e, "failed to open durable store");
            std::process::exit(1);
        }
    };
    let version_table = Arc::new(VersionTable::new(kv.clone()));
    let endpoint_table = Arc::new(EndpointTable::new(kv));

    // No bundled consensus engine: an external one (or an operator, via a
    // future admin surface) drives membership through this shared handle by
    // calling its set_* methods. The announce loop only ever reads from it
    // through the `ConsensusProvider` seam.
    let static_consensus = Arc::new(StaticConsensusProvider::new(BTreeSet::from([self_address]), Some(self_address)));
    static_consensus.set_self_node_url(self_node_url(&*signer, &cfg));
    let consensus: Arc<dyn ConsensusProvider> = Arc::new(AnnounceConsensusAdapter::new(static_consensus));

    let allow_peers = resolve_allow_peers(&cfg);
    let transport_cfg = TransportConfig {
        listen_addr: cfg.p2p.listen_addr.clone(),
        data_dir: cfg.node.data_dir.clone(),
        bootstrap: cfg.p2p.bootstrap.clone(),
        allow_peers,
    };
    let (transport, inbound_rx, p2p_join) = match Libp2pAnnounceTransport::spawn(transport_cfg, metrics.clone()) {
        Ok(v) => v,
        Err(e) => {
            error!(?e, "failed to start p2p transport");
            std::process::exit(1);
        }
    };

    let proxy_address = cfg
        .proxy
        .as_ref()
        .and_then(|p| Address::from_str(&p.proxied_validator_address).ok());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (_loop_handle, loop_join) = announce_loop::spawn(
        consensus,
        signer,
        transport,
        version_table,
        endpoint_table,
        inbound_rx,
        proxy_address,
        shutdown_rx,
        metrics.clone(),
    );

    let http_addr: SocketAddr = match cfg.http.listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(?e, addr = %cfg.http.listen_addr, "invalid http listen address");
            std::process::exit(1);
        }
    };
    let http_join = tokio::spawn(metrics_http::serve(http_addr, metrics));

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
    let _ = shutdown_tx.send(true);

    let _ = loop_join.await;
    http_join.abort();
    let _ = p2p_join.await;
}
