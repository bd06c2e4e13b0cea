//! sxgpkg - serves AMP documents as signed exchanges.
//!
//! Loads the TOML configuration and the signing certificate, then runs the
//! packager HTTP server until it is stopped. Any configuration or
//! certificate problem aborts startup before the port is bound.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use sxgpkg_core::PackagerConfig;
use sxgpkg_server::{
    AppState, BaseUrlOverride, HttpOriginClient, OcspRefresher, Packager, PackagerSettings,
    RuntimeCache, RuntimeInfo, RuntimePoller, Server, ServerConfig,
};
use sxgpkg_signer::{CertificateContext, CertificateStore};
use sxgpkg_transform::Pipeline;

/// sxgpkg - signed exchange packager for AMP documents
#[derive(Parser, Debug)]
#[command(name = "sxgpkg", version, about)]
struct Args {
    /// Path to the TOML configuration
    #[arg(long, short, default_value = "sxgpkg.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write daily-rotated logs to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Send every origin fetch to this base URL instead (development only)
    #[arg(long)]
    origin_override: Option<Url>,
}

/// Initialize logging, with file rotation when a log directory is given.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("sxgpkg={},tower_http={},warn", log_level, log_level))
    });

    if let Some(log_dir) = &args.log_dir {
        if std::fs::create_dir_all(log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(7)
                .filename_prefix("sxgpkg")
                .filename_suffix("log")
                .build(log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }

        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        tracing::warn!("File logging unavailable in {:?}, using console only", log_dir);
        return None;
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    None
}

/// Loads the leaf, issuers and key, plus the OCSP override when configured.
fn load_certificate(config: &PackagerConfig) -> anyhow::Result<CertificateContext> {
    let context = CertificateContext::load(&config.cert_file, &config.key_file)
        .context("loading signing certificate")?;
    match &config.ocsp_file {
        Some(path) => Ok(context
            .with_ocsp_file(path)
            .with_context(|| format!("loading OCSP response {:?}", path))?),
        None => Ok(context),
    }
}

/// Builds the packager from the loaded configuration.
fn build_packager(config: &PackagerConfig, args: &Args) -> anyhow::Result<Packager> {
    let pipeline = Pipeline::from_config(config.transforms.as_deref())
        .context("resolving transforms")?;
    tracing::info!("Transform pipeline: {:?}", pipeline.transforms());

    let certs = CertificateStore::new(load_certificate(config)?);

    let css = config
        .runtime_css_file
        .as_ref()
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("reading runtime CSS {:?}", path))
        })
        .transpose()?;
    let runtime = RuntimeCache::new(RuntimeInfo {
        version: config.runtime_version.clone(),
        css,
    });
    let settings = PackagerSettings::from_config(config)?;

    let client = HttpOriginClient::new(
        Duration::from_secs(config.fetch_timeout_secs),
        config.max_payload_bytes,
    )
    .context("building origin client")?;

    let mut packager = Packager::new(
        config.build_matcher()?,
        pipeline,
        Arc::new(certs),
        Arc::new(client),
    )
    .with_settings(settings)
    .with_runtime(Arc::new(runtime));

    if let Some(base) = &args.origin_override {
        tracing::warn!("Origin fetches are redirected to {}", base);
        packager = packager.with_resolver(Arc::new(BaseUrlOverride::new(base.clone())));
    }
    Ok(packager)
}

/// Fetches OCSP and runtime metadata once, then keeps them fresh in the
/// background. Initial failures are logged; the packager proxies unsigned
/// until OCSP is available.
async fn start_refreshers(config: &PackagerConfig, packager: &Packager) -> anyhow::Result<()> {
    match &config.ocsp_file {
        Some(path) => {
            tracing::info!("Using OCSP response from {:?}; it will not be refreshed", path);
        }
        None => {
            let refresher = Arc::new(
                OcspRefresher::new(Arc::clone(packager.certs()), Arc::clone(packager.chains()))
                    .context("building OCSP client")?,
            );
            if let Err(e) = refresher.refresh().await {
                tracing::warn!("Initial OCSP fetch failed, serving unsigned until it succeeds: {}", e);
            }
            tokio::spawn(refresher.run());
        }
    }

    if let Some(url) = config.runtime_metadata_url()? {
        let poller = Arc::new(
            RuntimePoller::new(url, Arc::clone(packager.runtime()))
                .context("building runtime metadata client")?,
        );
        if let Err(e) = poller.poll().await {
            tracing::warn!("Initial AMP runtime poll failed, keeping configured values: {}", e);
        }
        tokio::spawn(poller.run());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_logging(&args);

    tracing::info!("sxgpkg {} starting", env!("CARGO_PKG_VERSION"));

    let config = PackagerConfig::load(&args.config)
        .with_context(|| format!("loading config {:?}", args.config))?;
    let packager = build_packager(&config, &args)?;
    start_refreshers(&config, &packager).await?;

    let server_config = ServerConfig::default()
        .with_host(config.host.clone())
        .with_port(config.port);
    let server = Server::with_state(server_config, AppState::new(packager))?;
    server.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["sxgpkg"]).unwrap();
        assert_eq!(args.config, PathBuf::from("sxgpkg.toml"));
        assert_eq!(args.log_level, "info");
        assert!(!args.debug);
        assert!(args.log_dir.is_none());
        assert!(args.origin_override.is_none());
    }

    #[test]
    fn args_override() {
        let args = Args::try_parse_from([
            "sxgpkg",
            "-c",
            "/etc/sxgpkg.toml",
            "--debug",
            "--origin-override",
            "http://127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/sxgpkg.toml"));
        assert!(args.debug);
        assert_eq!(
            args.origin_override.unwrap().as_str(),
            "http://127.0.0.1:9000/"
        );
    }

    #[test]
    fn rejects_bad_override_url() {
        assert!(Args::try_parse_from(["sxgpkg", "--origin-override", "not a url"]).is_err());
    }
}
