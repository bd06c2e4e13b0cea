use kuchikiki::NodeRef;
use url::Url;

use super::{TransformContext, TransformPass};
use crate::amp::in_template;
use crate::dom::{attr, elements, is_element, remove_attr, set_attr, tag_name};
use crate::error::Result;

const ANY_TAG_ATTRS: &[&str] = &["src"];
const FORM_ATTRS: &[&str] = &["action", "action-xhr"];
const IMG_ATTRS: &[&str] = &["longdesc"];
const AMP_INSTALL_SERVICEWORKER_ATTRS: &[&str] =
    &["data-iframe-src", "data-no-service-worker-fallback-shell-url"];
const AMP_STORY_ATTRS: &[&str] = &[
    "background-audio",
    "bookend-config-src",
    "poster-landscape-src",
    "poster-square-src",
    "publisher-logo-src",
];
const AMP_STORY_PAGE_ATTRS: &[&str] = &["background-audio"];

const DEFAULT_TARGET: &str = "_top";

/// Makes URLs in the document independent of where it is served from.
///
/// Relative URLs are resolved against `<base href>` (or the document URL),
/// links to the document itself become bare fragments and anchors get an
/// explicit target. The `<base href>` is removed afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlRewrite;

#[derive(Debug)]
struct BaseInfo {
    url: Url,
    target: String,
}

impl TransformPass for UrlRewrite {
    fn name(&self) -> &'static str {
        "url"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let base = extract_base(&ctx.dom.head, &ctx.document_url);
        for node in elements(&ctx.dom.document) {
            rewrite_node(&node, &base);
        }
        Ok(())
    }
}

fn is_allowed_target(target: &str) -> bool {
    target.eq_ignore_ascii_case("_blank") || target.eq_ignore_ascii_case("_top")
}

fn extract_base(head: &NodeRef, document_url: &Url) -> BaseInfo {
    let mut info = BaseInfo {
        url: document_url.clone(),
        target: DEFAULT_TARGET.to_string(),
    };
    let Some(base) = head.descendants().find(|n| is_element(n, "base")) else {
        return info;
    };
    if let Some(href) = attr(&base, "href") {
        if let Ok(url) = document_url.join(href.trim()) {
            info.url = url;
        }
    }
    if let Some(target) = attr(&base, "target").filter(|t| is_allowed_target(t)) {
        info.target = target;
    }
    info
}

fn rewrite_node(node: &NodeRef, base: &BaseInfo) {
    let Some(tag) = tag_name(node) else {
        return;
    };
    if tag.eq_ignore_ascii_case("amp-img") {
        return;
    }
    let templated = in_template(node);

    rewrite_attrs(node, &base.url, ANY_TAG_ATTRS, false, templated);
    let extra: Option<(&[&str], bool)> = match tag.as_str() {
        "form" => Some((FORM_ATTRS, true)),
        "img" => Some((IMG_ATTRS, false)),
        "amp-install-serviceworker" => Some((AMP_INSTALL_SERVICEWORKER_ATTRS, false)),
        "amp-story" => Some((AMP_STORY_ATTRS, false)),
        "amp-story-page" => Some((AMP_STORY_PAGE_ATTRS, false)),
        _ => None,
    };
    if let Some((attrs, absolute)) = extra {
        rewrite_attrs(node, &base.url, attrs, absolute, templated);
    }

    let Some(href) = attr(node, "href") else {
        return;
    };
    match tag.as_str() {
        "base" => {
            remove_attr(node, "href");
            let empty = node
                .as_element()
                .is_some_and(|e| e.attributes.borrow().map.is_empty());
            if empty {
                node.detach();
            }
        }
        "link" if attr(node, "rel").as_deref() == Some("canonical") => {
            set_attr(node, "href", rewrite_url(&base.url, templated, &href, true));
        }
        "a" => {
            let portable = rewrite_url(&base.url, templated, &href, false);
            if !portable.starts_with('#')
                && !attr(node, "target").is_some_and(|t| is_allowed_target(&t))
            {
                set_attr(node, "target", base.target.as_str());
            }
            set_attr(node, "href", portable);
        }
        _ => {
            set_attr(node, "href", rewrite_url(&base.url, templated, &href, false));
        }
    }
}

fn rewrite_attrs(node: &NodeRef, base: &Url, names: &[&str], absolute: bool, templated: bool) {
    if templated {
        return;
    }
    for name in names {
        if let Some(value) = attr(node, name) {
            set_attr(node, name, rewrite_url(base, false, &value, absolute));
        }
    }
}

/// Resolves `value` against `base`.
///
/// Non-http(s) results are returned trimmed but otherwise untouched. In
/// portable mode a link to the base document with a fragment collapses to
/// the bare fragment.
pub fn rewrite_url(base: &Url, templated: bool, value: &str, absolute: bool) -> String {
    if templated {
        return value.to_string();
    }
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return value.to_string();
    }
    let candidate = if trimmed.starts_with("//") {
        format!("https:{}", trimmed)
    } else {
        trimmed.to_string()
    };
    let resolved = match base.join(&candidate) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => u,
        _ => return trimmed.to_string(),
    };
    if absolute {
        return resolved.to_string();
    }
    if let Some(fragment) = resolved.fragment() {
        let mut without_fragment = resolved.clone();
        without_fragment.set_fragment(None);
        let mut base_without_fragment = base.clone();
        base_without_fragment.set_fragment(None);
        if without_fragment == base_without_fragment {
            return format!("#{}", fragment);
        }
    }
    resolved.to_string()
}
