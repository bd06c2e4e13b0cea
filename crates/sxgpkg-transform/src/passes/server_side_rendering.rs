use kuchikiki::NodeRef;
use tracing::debug;

use super::{TransformContext, TransformPass};
use crate::amp::{
    in_template, is_amp_custom_element, is_boilerplate_style, AMP_AUDIO,
    AMP_DYNAMIC_CSS_CLASSES, AMP_EXPERIMENT, AMP_RUNTIME, AMP_STORY, I_AMPHTML_LAYOUT,
    NO_BOILERPLATE,
};
use crate::dom::{attr, elements, has_attr, is_descendant_of, is_element, new_element, set_attr, tag_name};
use crate::error::Result;
use crate::layout::apply_layout;

/// Lays out AMP components on the server so the boilerplate can go.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSideRendering;

impl TransformPass for ServerSideRendering {
    fn name(&self) -> &'static str {
        "serversiderendering"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let dom = &ctx.dom;
        if has_attr(&dom.html, I_AMPHTML_LAYOUT) {
            return Ok(());
        }
        set_attr(&dom.html, I_AMPHTML_LAYOUT, "");

        let mut remove = true;
        for node in elements(&dom.body) {
            if !is_amp_custom_element(&node) || in_template(&node) {
                continue;
            }
            remove = remove && can_remove_boilerplate(&node);
            if has_attr(&node, "style") {
                continue;
            }
            if let Err(reason) = apply_layout(&node) {
                debug!(
                    "Keeping boilerplate, cannot lay out <{}>: {}",
                    tag_name(&node).unwrap_or_default(),
                    reason
                );
                remove = false;
            }
        }

        if !dom
            .head
            .children()
            .any(|c| is_element(&c, "style") && has_attr(&c, AMP_RUNTIME))
        {
            dom.head.prepend(new_element("style", &[(AMP_RUNTIME, "")])?);
        }

        remove = remove && elements(&dom.head).iter().all(can_remove_boilerplate);
        if remove {
            set_attr(&dom.html, NO_BOILERPLATE, "");
            for child in dom.head.children().collect::<Vec<_>>() {
                if is_element(&child, "noscript") || is_boilerplate_style(&child) {
                    child.detach();
                }
            }
        }
        Ok(())
    }
}

/// False when the element needs the runtime before first paint.
fn can_remove_boilerplate(node: &NodeRef) -> bool {
    if in_template(node) {
        return true;
    }
    if is_amp_custom_element(node) && is_descendant_of(node, "body") {
        let tag = tag_name(node).unwrap_or_default();
        if tag == AMP_EXPERIMENT && has_experiment_config(node) {
            return false;
        }
        if tag == AMP_AUDIO
            || ["heights", "media", "sizes", "style"]
                .iter()
                .any(|a| has_attr(node, a))
        {
            return false;
        }
    }
    if is_element(node, "script") && is_descendant_of(node, "head") {
        if let Some(ext) = attr(node, "custom-element") {
            if ext == AMP_DYNAMIC_CSS_CLASSES || ext == AMP_STORY {
                return false;
            }
        }
    }
    true
}

/// True when an `<amp-experiment>` carries a non-empty JSON config.
fn has_experiment_config(node: &NodeRef) -> bool {
    node.children()
        .filter(|c| {
            is_element(c, "script")
                && attr(c, "type").is_some_and(|t| t.eq_ignore_ascii_case("application/json"))
        })
        .any(|script| {
            serde_json::from_str::<serde_json::Value>(&script.text_contents())
                .ok()
                .and_then(|v| v.as_object().map(|o| !o.is_empty()))
                .unwrap_or(false)
        })
}
