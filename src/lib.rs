//! geotunnel - local tunnel supervisor
//!
//! Gives an application outbound access through a user-supplied
//! subscription of proxy links when direct access is geo-restricted:
//! - Subscription fetch with base64/plain bodies and an on-disk cache
//! - VLESS and VMess link decoding
//! - Xray engine configuration generation
//! - Engine download, launch, liveness probe and teardown
//! - Retry across candidates until one tunnel is live
//!
//! Callers only see [`TunnelManager::get_proxy`] and
//! [`TunnelManager::shutdown`].
//!
//! # Architecture
//!
//! ```text
//!                  +------------------+
//!                  |     tunnel/      |
//!                  | (TunnelManager)  |
//!                  +--------+---------+
//!                           |
//!        +------------------+------------------+
//!        |                  |                  |
//! +------v------+   +-------v-------+   +------v-------+
//! |  provider/  |   |   outbound/   |   | supervisor/  |
//! | (subscript) |   |  (decoders)   |   |  (process)   |
//! +-------------+   +-------+-------+   +--------------+
//!                           |
//!                   +-------v-------+
//!                   |    config/    |
//!                   | (engine JSON) |
//!                   +---------------+
//! ```

pub mod common;
pub mod config;
pub mod outbound;
pub mod provider;
pub mod supervisor;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Settings;
pub use tunnel::{ManagerState, ProxyEndpoint, TunnelManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
