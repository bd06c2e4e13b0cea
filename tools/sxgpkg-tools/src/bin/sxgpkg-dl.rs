//! Downloads a signed exchange and the certificate chain it points to.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use reqwest::header::ACCEPT;
use url::Url;

use sxgpkg_core::SXG_CONTENT_TYPE;
use sxgpkg_signer::{extract_cert_url, CERT_CHAIN_CONTENT_TYPE};

#[derive(Parser, Debug)]
#[command(name = "sxgpkg-dl")]
#[command(about = "Fetch a signed exchange and its certificate chain")]
struct Args {
    /// URL to request with the signed exchange Accept header.
    url: Url,

    /// Where to write the exchange.
    #[arg(long, default_value = "exchange.sxg")]
    out: PathBuf,

    /// Where to write the certificate chain.
    #[arg(long, default_value = "cert.cbor")]
    cert_out: PathBuf,
}

async fn fetch(client: &reqwest::Client, url: &Url, accept: &str) -> Result<Vec<u8>> {
    tracing::info!("Fetching {}", url);
    let response = client
        .get(url.clone())
        .header(ACCEPT, accept)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", url))?;

    let status = response.status();
    if !status.is_success() {
        bail!("{} returned {}", url, status);
    }
    Ok(response.bytes().await?.to_vec())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("sxgpkg=info")
        .with_writer(std::io::stderr)
        .init();

    let client = reqwest::Client::builder()
        .user_agent(concat!("sxgpkg-dl/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let exchange = fetch(&client, &args.url, SXG_CONTENT_TYPE).await?;
    std::fs::write(&args.out, &exchange)
        .with_context(|| format!("Failed to write {}", args.out.display()))?;
    println!("Wrote {} ({} bytes)", args.out.display(), exchange.len());

    let cert_url = extract_cert_url(&exchange).context("No cert URL in exchange")?;
    let chain = fetch(&client, &cert_url, CERT_CHAIN_CONTENT_TYPE).await?;
    std::fs::write(&args.cert_out, &chain)
        .with_context(|| format!("Failed to write {}", args.cert_out.display()))?;
    println!("Wrote {} ({} bytes)", args.cert_out.display(), chain.len());

    Ok(())
}
