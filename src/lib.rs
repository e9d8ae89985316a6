pub mod arg;
pub mod backend;
pub mod config;
mod control;
mod dns;
mod error;
mod helper;
mod http;
mod option;
pub mod pool;
pub mod router;
mod router_app;
mod socks5;

pub use arg::WrapAddr;
pub use backend::{BackendEvent, BackendInfo, BackendProcess, BackendState, Launcher, TorLauncher};
pub use control::server::ControlServer;
pub use dns::ProxyDns;
pub use error::{ProxyError, ProxyResult};
pub use helper::{Helper, PortAllocator};
pub use http::ProxyHttp;
pub use option::{Builder, ConfigOption, InstancesOption};
pub use pool::{InstanceDefinition, InstancePool, LoadBalanceMethod, TorConfig};
pub use router::{ConnectionRouter, InstanceConnection, Proto, ProxyByName, ProxyByNameMode};
pub use router_app::TorRouter;
pub use socks5::{ProxySocks5, TargetAddr};
