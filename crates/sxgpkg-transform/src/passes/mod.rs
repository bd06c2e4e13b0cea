//! Transform passes.
//!
//! Each pass mutates the shared [`TransformContext`] in place and must be
//! idempotent: running it on its own output is a no-op.

use url::Url;

use crate::dom::Dom;
use crate::error::Result;

mod boilerplate;
mod link_tag;
mod meta_tag;
mod normalize;
mod reorder_head;
mod runtime_css;
mod server_side_rendering;
mod transformed_identifier;
mod url_rewrite;

pub use boilerplate::AmpBoilerplate;
pub use link_tag::LinkTag;
pub use meta_tag::MetaTag;
pub use normalize::Normalize;
pub use reorder_head::ReorderHead;
pub use runtime_css::AmpRuntimeCss;
pub use server_side_rendering::ServerSideRendering;
pub use transformed_identifier::TransformedIdentifier;
pub use url_rewrite::UrlRewrite;

/// State shared by the passes of one transform run.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub dom: Dom,
    /// URL the document will be served from; base for relative URLs.
    pub document_url: Url,
    /// AMP runtime version (rtv) to pin, if any.
    pub runtime_version: Option<String>,
    /// Runtime CSS to inline in `<style amp-runtime>`.
    pub runtime_css: Option<String>,
    /// Transform version advertised in `transformed=`.
    pub version: i64,
}

/// A single transformation over the document.
pub trait TransformPass: Send + Sync {
    /// Returns the pass name.
    fn name(&self) -> &'static str;

    /// Applies the pass.
    fn apply(&self, ctx: &mut TransformContext) -> Result<()>;
}
