//! Reverse-proxy routes for deployed applications
//!
//! Builds nginx route definitions for applications that own the site root
//! (direct hosting) or live under a path prefix (subdirectory hosting), and
//! activates them without ever leaving the proxy with a configuration that
//! fails its syntax check.

pub mod activate;
pub mod proxy;
pub mod route;

pub use activate::{RouteActivator, RouteError, RouteLayout};
pub use proxy::{NginxProxy, ProxyControl, ProxyError};
pub use route::{
    generate_route, ActiveRoute, HostingMode, RouteDefinition, RouteSettings, UpstreamScheme,
};
