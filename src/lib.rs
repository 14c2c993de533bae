pub mod api;
pub mod backend;
mod config;
pub mod context;
pub mod server;
pub mod viewer;

pub use backend::{BackendClient, TenancyDirectory};
pub use config::{CONFIG_ENV, GatewayConfig, load_config, load_config_from};
pub use context::{Context, ContextLayer};
pub use server::{build_app, serve};
pub use viewer::{
    TenancyError, TenancyLayer, TenancyResolver, UpgradeBridge, UpgradeBridgeLayer, Viewer,
};
