//! Runs the transform pipeline over a local document.
//!
//! Prints the markup the packager would sign, which is handy when a page
//! fails validation or renders differently from the cache.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use sxgpkg_transform::{transform, TransformRequest};

#[derive(Parser, Debug)]
#[command(name = "sxgpkg-transform")]
#[command(about = "Transform an AMP document the way the packager does")]
struct Args {
    /// Input file; reads stdin when omitted.
    file: Option<PathBuf>,

    /// URL the document will be served from.
    #[arg(long, default_value = "https://example.com/")]
    url: Url,

    /// Comma-separated transform names; the default pipeline when omitted.
    #[arg(long, value_delimiter = ',')]
    transforms: Option<Vec<String>>,

    /// Transform version to record.
    #[arg(long, default_value_t = 1)]
    version: i64,

    /// Runtime version (rtv) to pin.
    #[arg(long)]
    rtv: Option<String>,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn read_input(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut markup = String::new();
            std::io::stdin()
                .read_to_string(&mut markup)
                .context("Failed to read stdin")?;
            Ok(markup)
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("sxgpkg={}", level))
        .with_writer(std::io::stderr)
        .init();

    let mut request = TransformRequest::new(read_input(args.file.as_ref())?, args.url)
        .with_version(args.version);
    request.transforms = args.transforms;
    request.runtime_version = args.rtv;

    let output = transform(&request).context("Transform failed")?;
    println!("{}", output);
    Ok(())
}
