use kuchikiki::NodeRef;

use super::{TransformContext, TransformPass};
use crate::amp::AMP_CUSTOM;
use crate::dom::{attr, has_attr, is_descendant_of, is_element, remove_attr, set_attr};
use crate::error::Result;

const UNSANITARY_URI_CHARS: &[char] = &['\t', '\n', '\r'];
const HTML_WHITESPACE: &[char] = &[' ', '\t', '\n', '\x0c', '\r'];

/// Cleans up the parsed tree before any real pass runs.
///
/// Always first in a pipeline. It is not selectable by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalize;

impl TransformPass for Normalize {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let nodes: Vec<NodeRef> = ctx.dom.document.descendants().collect();
        for node in nodes {
            if node.as_comment().is_some() {
                node.detach();
            } else if node.as_doctype().is_some() {
                node.insert_before(NodeRef::new_doctype("html", "", ""));
                node.detach();
            } else if let Some(text) = node.as_text() {
                clean_text(&node, text);
            } else if node.as_element().is_some() {
                clean_element(&node);
            }
        }
        fix_style_amp_custom(&ctx.dom.head);
        Ok(())
    }
}

fn clean_element(node: &NodeRef) {
    remove_attr(node, "nonce");
    for name in ["src", "href"] {
        if let Some(value) = attr(node, name) {
            if value.contains(UNSANITARY_URI_CHARS) {
                set_attr(node, name, value.replace(UNSANITARY_URI_CHARS, ""));
            }
        }
    }
    if is_element(node, "title") && !is_descendant_of(node, "svg") {
        strip_extra_title(node);
    }
}

/// Keeps the first `<title>` in head and drops any in body.
fn strip_extra_title(node: &NodeRef) {
    if is_descendant_of(node, "head") {
        if node.preceding_siblings().any(|s| is_element(&s, "title")) {
            node.detach();
        }
    } else if is_descendant_of(node, "body") {
        node.detach();
    }
}

fn clean_text(node: &NodeRef, text: &std::cell::RefCell<String>) {
    let parent = node.parent();
    let in_title = parent.as_ref().is_some_and(|p| is_element(p, "title"));
    if text.borrow().trim_start_matches(HTML_WHITESPACE).is_empty()
        && !is_descendant_of(node, "body")
        && !in_title
    {
        node.detach();
        return;
    }

    // Server-side template delimiters confuse some caches; escape them.
    let replaced = match parent {
        Some(ref p) if is_element(p, "script") => Some(
            text.borrow()
                .replace("<%", "\\u003c%")
                .replace("%>", "%\\u003e"),
        ),
        Some(ref p) if is_element(p, "style") => {
            Some(text.borrow().replace("<%", "\\3c %").replace("%>", "%\\3e "))
        }
        _ => None,
    };
    if let Some(replaced) = replaced {
        *text.borrow_mut() = replaced;
    }
}

/// `<style amp-custom>` keeps only its marker attribute, or goes away when empty.
fn fix_style_amp_custom(head: &NodeRef) {
    let Some(style) = head
        .children()
        .find(|c| is_element(c, "style") && has_attr(c, AMP_CUSTOM))
    else {
        return;
    };
    if style.first_child().is_none() {
        style.detach();
    } else if let Some(e) = style.as_element() {
        let mut attrs = e.attributes.borrow_mut();
        attrs.map.clear();
        attrs.insert(AMP_CUSTOM, String::new());
    }
}
