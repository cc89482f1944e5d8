#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Observability: Prometheus metrics and the `/metrics` + `/healthz` HTTP surface.

pub mod http;
pub mod metrics;
