use std::collections::HashSet;

use kuchikiki::NodeRef;

use super::{TransformContext, TransformPass};
use crate::amp::{
    extension_name, is_boilerplate_style, is_render_delaying_script, is_runtime_script,
    is_viewer_script, AMP_CACHE_SCHEME_AND_HOST, AMP_CUSTOM, AMP_RUNTIME,
};
use crate::dom::{attr, has_attr, is_element};
use crate::error::Result;

/// Head buckets, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    MetaCharset,
    MetaViewport,
    RuntimeCssLink,
    StyleAmpRuntime,
    MetaOther,
    RuntimeScript,
    ViewerScript,
    RenderDelayingScript,
    ExtensionScript,
    Favicon,
    ResourceHint,
    Stylesheet,
    StyleAmpCustom,
    Other,
    StyleBoilerplate,
    Noscript,
}

const SLOT_COUNT: usize = Slot::Noscript as usize + 1;

/// Sorts head children into the order the AMP cache serves them in.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderHead;

impl TransformPass for ReorderHead {
    fn name(&self) -> &'static str {
        "reorderhead"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let head = &ctx.dom.head;
        let mut slots: Vec<Vec<NodeRef>> = vec![Vec::new(); SLOT_COUNT];
        for child in head.children().collect::<Vec<_>>() {
            child.detach();
            slots[slot_of(&child) as usize].push(child);
        }
        for slot in [Slot::RenderDelayingScript, Slot::ExtensionScript] {
            let scripts = std::mem::take(&mut slots[slot as usize]);
            slots[slot as usize] = dedupe_and_sort_extensions(scripts);
        }
        for node in slots.into_iter().flatten() {
            head.append(node);
        }
        Ok(())
    }
}

fn rel_tokens(node: &NodeRef) -> Vec<String> {
    attr(node, "rel")
        .map(|r| {
            r.to_ascii_lowercase()
                .split_ascii_whitespace()
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn is_runtime_css_link(node: &NodeRef) -> bool {
    attr(node, "href").is_some_and(|href| {
        href.starts_with(AMP_CACHE_SCHEME_AND_HOST) && href.ends_with("/v0.css")
    })
}

fn slot_of(node: &NodeRef) -> Slot {
    if is_element(node, "meta") {
        if has_attr(node, "charset") {
            Slot::MetaCharset
        } else if attr(node, "name").as_deref() == Some("viewport") {
            Slot::MetaViewport
        } else {
            Slot::MetaOther
        }
    } else if is_element(node, "link") {
        let rel = rel_tokens(node);
        if rel.iter().any(|t| t == "stylesheet") {
            if is_runtime_css_link(node) {
                Slot::RuntimeCssLink
            } else {
                Slot::Stylesheet
            }
        } else if rel.iter().any(|t| t.contains("icon")) {
            Slot::Favicon
        } else if rel
            .iter()
            .any(|t| matches!(t.as_str(), "dns-prefetch" | "preconnect"))
        {
            Slot::ResourceHint
        } else {
            Slot::Other
        }
    } else if is_element(node, "script") {
        if is_runtime_script(node) {
            Slot::RuntimeScript
        } else if is_viewer_script(node) {
            Slot::ViewerScript
        } else if is_render_delaying_script(node) {
            Slot::RenderDelayingScript
        } else if extension_name(node).is_some() {
            Slot::ExtensionScript
        } else {
            Slot::Other
        }
    } else if is_element(node, "style") {
        if has_attr(node, AMP_RUNTIME) {
            Slot::StyleAmpRuntime
        } else if has_attr(node, AMP_CUSTOM) {
            Slot::StyleAmpCustom
        } else if is_boilerplate_style(node) {
            Slot::StyleBoilerplate
        } else {
            Slot::Other
        }
    } else if is_element(node, "noscript") {
        Slot::Noscript
    } else {
        Slot::Other
    }
}

/// Keeps the first script per extension and orders them by name.
fn dedupe_and_sort_extensions(scripts: Vec<NodeRef>) -> Vec<NodeRef> {
    let mut seen = HashSet::new();
    let mut named: Vec<(String, NodeRef)> = scripts
        .into_iter()
        .filter_map(|s| extension_name(&s).map(|name| (name, s)))
        .filter(|(name, _)| seen.insert(name.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.into_iter().map(|(_, s)| s).collect()
}
