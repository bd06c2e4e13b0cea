use kuchikiki::NodeRef;
use url::Url;

use super::{TransformContext, TransformPass};
use crate::dom::{attr, elements, has_attr, is_element, new_element, remove_attr, set_attr};
use crate::error::Result;

const RESOURCE_HINTS: &[&str] = &["dns-prefetch", "preconnect", "prefetch", "preload", "prerender"];
const GOOGLE_FONTS_HOST: &str = "fonts.googleapis.com";
const GSTATIC_ORIGIN: &str = "https://fonts.gstatic.com";
const GSTATIC_REL: &str = "dns-prefetch preconnect";

/// Disables author-supplied resource hints and preconnects to the Google
/// Fonts static host ahead of the first font stylesheet.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkTag;

impl TransformPass for LinkTag {
    fn name(&self) -> &'static str {
        "linktag"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let mut preconnect_seen = false;
        for node in elements(&ctx.dom.document) {
            if is_gstatic_preconnect(&node) {
                preconnect_seen = true;
                continue;
            }
            if has_attr(&node, "rel") {
                disable_resource_hints(&node);
            }
            if !preconnect_seen && is_google_font_link(&node) {
                let preconnect = new_element(
                    "link",
                    &[("crossorigin", ""), ("href", GSTATIC_ORIGIN), ("rel", GSTATIC_REL)],
                )?;
                node.insert_before(preconnect);
                preconnect_seen = true;
            }
        }
        Ok(())
    }
}

fn is_gstatic_preconnect(node: &NodeRef) -> bool {
    is_element(node, "link")
        && attr(node, "href").as_deref() == Some(GSTATIC_ORIGIN)
        && attr(node, "rel").as_deref() == Some(GSTATIC_REL)
}

fn is_google_font_link(node: &NodeRef) -> bool {
    is_element(node, "link")
        && attr(node, "href")
            .and_then(|href| Url::parse(&href).ok())
            .and_then(|u| u.host_str().map(|h| h.eq_ignore_ascii_case(GOOGLE_FONTS_HOST)))
            .unwrap_or(false)
}

fn disable_resource_hints(node: &NodeRef) {
    let Some(rel) = attr(node, "rel") else {
        return;
    };
    let lowered = rel.to_ascii_lowercase();
    if lowered
        .split_ascii_whitespace()
        .any(|token| RESOURCE_HINTS.contains(&token))
    {
        set_attr(node, "disabled-rel", rel);
        remove_attr(node, "rel");
    }
}
