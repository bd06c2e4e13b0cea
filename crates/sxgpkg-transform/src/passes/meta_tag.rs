use kuchikiki::NodeRef;

use super::{TransformContext, TransformPass};
use crate::dom::{attr, elements, has_attr, is_descendant_of, is_element};
use crate::error::Result;

const KEPT_NAME_PREFIXES: &[&str] = &["amp-", "amp4ads-", "dc.", "i-amphtml-", "twitter:"];
const KEPT_NAMES: &[&str] = &["apple-itunes-app", "copyright", "referrer", "viewport"];
const KEPT_PROPERTY_PREFIXES: &[&str] = &["al:", "fb:", "og:"];

/// Drops `<meta>` tags the AMP cache does not allow and moves the rest of
/// the body metas into head.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaTag;

impl TransformPass for MetaTag {
    fn name(&self) -> &'static str {
        "metatag"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        for meta in elements(&ctx.dom.document) {
            if !is_element(&meta, "meta") {
                continue;
            }
            if should_strip(&meta) {
                meta.detach();
            } else if is_descendant_of(&meta, "body") {
                meta.detach();
                ctx.dom.head.append(meta);
            }
        }
        Ok(())
    }
}

fn should_strip(meta: &NodeRef) -> bool {
    if has_attr(meta, "charset") {
        return false;
    }
    if let Some(equiv) = attr(meta, "http-equiv") {
        return equiv.eq_ignore_ascii_case("x-dns-prefetch-control");
    }
    if !["content", "itemprop", "name", "property"]
        .iter()
        .any(|a| has_attr(meta, a))
    {
        return false;
    }
    if let Some(name) = attr(meta, "name").map(|n| n.to_ascii_lowercase()) {
        if KEPT_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
            || KEPT_NAMES.contains(&name.as_str())
        {
            return false;
        }
    }
    if let Some(property) = attr(meta, "property").map(|p| p.to_ascii_lowercase()) {
        if KEPT_PROPERTY_PREFIXES.iter().any(|p| property.starts_with(p)) {
            return false;
        }
    }
    !(has_attr(meta, "itemprop") && !has_attr(meta, "name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::test_support::{assert_idempotent, run};

    const PAGE: &str = concat!(
        "<html><head>",
        "<meta charset=utf-8>",
        "<meta name=viewport content=width=device-width>",
        "<meta http-equiv=x-dns-prefetch-control content=on>",
        "<meta http-equiv=content-language content=en>",
        "<meta name=description content=gone>",
        "<meta property=og:title content=kept>",
        "<meta name=twitter:card content=summary>",
        "</head><body>",
        "<meta itemprop=datePublished content=2020>",
        "<meta name=author content=gone>",
        "</body></html>"
    );

    #[test]
    fn keeps_only_allowed_metas() {
        let out = run(&MetaTag, PAGE);
        assert!(out.contains("charset"));
        assert!(out.contains("viewport"));
        assert!(!out.contains("x-dns-prefetch-control"));
        assert!(out.contains("content-language"));
        assert!(!out.contains("description"));
        assert!(out.contains("og:title"));
        assert!(out.contains("twitter:card"));
        assert!(!out.contains("author"));
    }

    #[test]
    fn moves_body_metas_to_head() {
        let out = run(&MetaTag, PAGE);
        let head_end = out.find("</head>").unwrap();
        let itemprop = out.find("datePublished").unwrap();
        assert!(itemprop < head_end);
    }

    #[test]
    fn is_idempotent() {
        assert_idempotent(&MetaTag, PAGE);
    }
}
