// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected peers gauge.
    pub p2p_peers: IntGauge,

    /// Invalid decoded messages.
    pub p2p_invalid_msg_total: IntCounter,
    /// Banned peer events.
    pub p2p_banned_total: IntCounter,

    /// Rows currently held in the version table.
    pub version_table_size: IntGauge,
    /// Addresses currently held in the endpoint table.
    pub endpoint_table_size: IntGauge,
    /// Version rows regossiped after surviving the per-source cooldown.
    pub version_regossip_total: IntCounter,
    /// Query messages regossiped after surviving the per-source cooldown.
    pub query_regossip_total: IntCounter,
    /// Query builds sent (non-empty `QueryEnode` messages multicast).
    pub query_sent_total: IntCounter,
    /// Endpoint certificates minted on a version bump.
    pub cert_minted_total: IntCounter,
    /// Protocol-level errors observed on the announce loop, labeled by
    /// `ProtocolError` variant name.
    pub protocol_errors_total: IntCounterVec,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let p2p_peers = IntGauge::new("amunchain_p2p_peers", "Connected peers")
            .map_err(|_| MetricsError::Prom)?;

        let p2p_invalid_msg_total = IntCounter::new(
            "amunchain_p2p_invalid_msg_total",
            "Invalid decoded messages",
        )
        .map_err(|_| MetricsError::Prom)?;
        let p2p_banned_total = IntCounter::new("amunchain_p2p_banned_total", "Banned peer events")
            .map_err(|_| MetricsError::Prom)?;

        let version_table_size =
            IntGauge::new("amunchain_version_table_size", "Rows in the version table").map_err(|_| MetricsError::Prom)?;
        let endpoint_table_size =
            IntGauge::new("amunchain_endpoint_table_size", "Addresses in the endpoint table").map_err(|_| MetricsError::Prom)?;
        let version_regossip_total = IntCounter::new(
            "amunchain_version_regossip_total",
            "Version rows regossiped after surviving the per-source cooldown",
        )
        .map_err(|_| MetricsError::Prom)?;
        let query_regossip_total = IntCounter::new(
            "amunchain_query_regossip_total",
            "Query messages regossiped after surviving the per-source cooldown",
        )
        .map_err(|_| MetricsError::Prom)?;
        let query_sent_total =
            IntCounter::new("amunchain_query_sent_total", "Query builds multicast").map_err(|_| MetricsError::Prom)?;
        let cert_minted_total = IntCounter::new("amunchain_cert_minted_total", "Endpoint certificates minted")
            .map_err(|_| MetricsError::Prom)?;
        let protocol_errors_total = IntCounterVec::new(
            Opts::new("amunchain_protocol_errors_total", "Protocol errors observed, by kind"),
            &["kind"],
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(p2p_peers.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_invalid_msg_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(p2p_banned_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(version_table_size.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(endpoint_table_size.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(version_regossip_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(query_regossip_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(query_sent_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(cert_minted_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(protocol_errors_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            p2p_peers,
            p2p_invalid_msg_total,
            p2p_banned_total,
            version_table_size,
            endpoint_table_size,
            version_regossip_total,
            query_regossip_total,
            query_sent_total,
            cert_minted_total,
            protocol_errors_total,
        })
    }

    /// Record a `ProtocolError`'s kind under the `protocol_errors_total` counter.
    pub fn record_protocol_error(&self, err: &crate::protocol::ProtocolError) {
        self.protocol_errors_total.with_label_values(&[err.kind()]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_without_panicking() {
        let m = Metrics::new().expect("metrics");
        m.version_table_size.set(3);
        m.record_protocol_error(&crate::protocol::ProtocolError::UnauthorizedSender);
        assert_eq!(m.version_table_size.get(), 3);
    }
}
