//! Hosting control plane: job dispatch to node agents, result ingestion
//! and the port/firewall bookkeeping that job results feed into.

pub mod auth;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod effects;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod ingest;
pub mod jobs;
pub mod model;
pub mod payload;
pub mod ports;
pub mod sinks;
pub mod store;
pub mod web;

pub use config::PanelConfig;
pub use engine::{ControlPlane, ControlPlaneBuilder};
pub use error::{PanelError, PanelResult};
