//! SXG Packager Transform - Markup rewriting before signing.
//!
//! An AMP document is parsed once, passed through an ordered list of
//! transforms and serialized again:
//!
//! - [`engine`] names the transforms and validates pipeline order
//! - [`passes`] holds one module per transform, plus normalization
//! - [`layout`] implements the server-side AMP layout algorithm
//!
//! Every pass is idempotent on its own output, so transforming an already
//! transformed document changes nothing.

pub mod amp;
pub mod dom;
pub mod engine;
pub mod error;
pub mod layout;
pub mod passes;

use tracing::debug;
use url::Url;

pub use engine::{Pipeline, Transform};
pub use error::{Result, TransformError};
pub use passes::{TransformContext, TransformPass};

use dom::Dom;

/// Input to a transform run.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    /// The document markup.
    pub markup: String,
    /// Where the document will be served from.
    pub document_url: Url,
    /// Transform names; `None` selects the default pipeline.
    pub transforms: Option<Vec<String>>,
    /// AMP runtime version (rtv) to pin.
    pub runtime_version: Option<String>,
    /// Runtime CSS to inline.
    pub runtime_css: Option<String>,
    /// Transform version written to `transformed=`.
    pub version: i64,
}

impl TransformRequest {
    pub fn new(markup: impl Into<String>, document_url: Url) -> Self {
        Self {
            markup: markup.into(),
            document_url,
            transforms: None,
            runtime_version: None,
            runtime_css: None,
            version: 1,
        }
    }

    /// Sets the transform version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }
}

impl Pipeline {
    /// Transforms a document with this pipeline.
    ///
    /// `request.transforms` is ignored; the pipeline was already resolved.
    pub fn apply(&self, request: &TransformRequest) -> Result<String> {
        let mut ctx = TransformContext {
            dom: Dom::parse(&request.markup)?,
            document_url: request.document_url.clone(),
            runtime_version: request.runtime_version.clone(),
            runtime_css: request.runtime_css.clone(),
            version: request.version,
        };
        self.run(&mut ctx)?;
        let output = ctx.dom.serialize();
        debug!(
            "Transformed {} ({} -> {} bytes)",
            request.document_url,
            request.markup.len(),
            output.len()
        );
        Ok(output)
    }
}

/// Transforms a document, resolving the pipeline from the request.
pub fn transform(request: &TransformRequest) -> Result<String> {
    Pipeline::from_config(request.transforms.as_deref())?.apply(request)
}
