use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tenant_viewer::{GatewayConfig, load_config, load_config_from};

#[derive(Parser)]
#[command(name = "tenant-viewer")]
#[command(about = "Tenant-aware request identity gateway")]
struct Cli {
    /// Config file (defaults to $TENANT_VIEWER_CONFIG, XDG or ./tenant-viewer.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Bind address, e.g. 0.0.0.0:8080
        #[arg(long, env = "TENANT_VIEWER_BIND")]
        bind: Option<String>,
        /// Authentication endpoint for WebSocket upgrades
        #[arg(long, env = "TENANT_VIEWER_AUTH_URL")]
        auth_url: Option<String>,
        /// Per-request deadline in seconds
        #[arg(long)]
        request_timeout_secs: Option<u64>,
        /// Comma-separated tenant allow-list
        #[arg(long, value_delimiter = ',')]
        tenants: Vec<String>,
    },
    /// Print the effective configuration as JSON
    ShowConfig,
}

fn effective_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    match path {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
}

fn log_filter(base: EnvFilter) -> Result<EnvFilter> {
    Ok(base
        .add_directive("tenant_viewer=info".parse()?)
        .add_directive("tower_http=info".parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    // The filter alone sets the level, so RUST_LOG can raise it.
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(EnvFilter::from_default_env())?)
        .init();

    let cli = Cli::parse();
    let mut config = effective_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve {
            bind,
            auth_url,
            request_timeout_secs,
            tenants,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if auth_url.is_some() {
                config.auth_url = auth_url;
            }
            if let Some(secs) = request_timeout_secs {
                config.request_timeout_secs = secs;
            }
            if !tenants.is_empty() {
                config.tenants = tenants;
            }

            info!("Starting tenant viewer on {}", config.bind);
            if config.tenants.is_empty() {
                info!("Accepting any tenant");
            } else {
                info!("Tenant allow-list: {}", config.tenants.join(", "));
            }

            let metrics = PrometheusBuilder::new().install_recorder()?;
            tenant_viewer::viewer::observe::describe_metrics();

            tenant_viewer::serve(&config, Some(metrics)).await?;
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_log_filter_defaults() {
        let filter = log_filter(EnvFilter::new("")).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("tenant_viewer=info"), "{rendered}");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_log_filter_keeps_more_verbose_directives() {
        let filter = log_filter(EnvFilter::new("tenant_viewer::viewer=debug")).unwrap();
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }
}
