//! Small helpers over the kuchikiki tree.

use kuchikiki::traits::*;
use kuchikiki::NodeRef;

use crate::error::{Result, TransformError};

/// The parsed document with handles to its structural elements.
#[derive(Debug, Clone)]
pub struct Dom {
    pub document: NodeRef,
    pub html: NodeRef,
    pub head: NodeRef,
    pub body: NodeRef,
}

impl Dom {
    /// Parses markup. The HTML tree builder always synthesizes html/head/body.
    pub fn parse(markup: &str) -> Result<Self> {
        Self::new(kuchikiki::parse_html().one(markup))
    }

    /// Locates html, head and body in an already parsed document.
    pub fn new(document: NodeRef) -> Result<Self> {
        let html = document
            .children()
            .find(|n| is_element(n, "html"))
            .ok_or(TransformError::MissingElement("html"))?;
        let head = html
            .children()
            .find(|n| is_element(n, "head"))
            .ok_or(TransformError::MissingElement("head"))?;
        let body = html
            .children()
            .find(|n| is_element(n, "body"))
            .ok_or(TransformError::MissingElement("body"))?;
        Ok(Self {
            document,
            html,
            head,
            body,
        })
    }

    /// Serializes the document.
    pub fn serialize(&self) -> String {
        self.document.to_string()
    }
}

/// Local name of an element, or `None` for other node kinds.
pub fn tag_name(node: &NodeRef) -> Option<String> {
    node.as_element().map(|e| e.name.local.to_string())
}

/// True if `node` is an element named `name`.
pub fn is_element(node: &NodeRef, name: &str) -> bool {
    node.as_element()
        .is_some_and(|e| &*e.name.local == name)
}

/// Returns an attribute value.
pub fn attr(node: &NodeRef, name: &str) -> Option<String> {
    node.as_element()
        .and_then(|e| e.attributes.borrow().get(name).map(str::to_string))
}

/// True if the attribute is present, even with an empty value.
pub fn has_attr(node: &NodeRef, name: &str) -> bool {
    node.as_element()
        .is_some_and(|e| e.attributes.borrow().contains(name))
}

/// Sets (or replaces) an attribute.
pub fn set_attr(node: &NodeRef, name: &str, value: impl Into<String>) {
    if let Some(e) = node.as_element() {
        e.attributes.borrow_mut().insert(name, value.into());
    }
}

/// Removes an attribute.
pub fn remove_attr(node: &NodeRef, name: &str) {
    if let Some(e) = node.as_element() {
        e.attributes.borrow_mut().remove(name);
    }
}

/// Appends `value` to an attribute, joined with `separator`.
pub fn append_attr(node: &NodeRef, name: &str, value: &str, separator: &str) {
    let joined = match attr(node, name) {
        Some(existing) if !existing.trim().is_empty() => {
            format!("{}{}{}", existing.trim_end_matches(separator), separator, value)
        }
        _ => value.to_string(),
    };
    set_attr(node, name, joined);
}

/// True if any ancestor of `node` is an element named `name`.
pub fn is_descendant_of(node: &NodeRef, name: &str) -> bool {
    node.ancestors().any(|a| is_element(&a, name))
}

/// All descendant elements in document order, collected so callers may mutate.
pub fn elements(root: &NodeRef) -> Vec<NodeRef> {
    root.descendants()
        .filter(|n| n.as_element().is_some())
        .collect()
}

/// Creates a detached element with the given attributes.
///
/// The element is produced by the HTML parser so it gets the right
/// namespace.
pub fn new_element(name: &str, attrs: &[(&str, &str)]) -> Result<NodeRef> {
    let parsed = kuchikiki::parse_html().one(format!("<{0}></{0}>", name));
    let node = parsed
        .descendants()
        .find(|n| is_element(n, name))
        .ok_or_else(|| TransformError::Pass {
            pass: "dom",
            message: format!("could not create <{}>", name),
        })?;
    node.detach();
    for (k, v) in attrs {
        set_attr(&node, k, *v);
    }
    Ok(node)
}

/// Creates a detached element holding a single text child.
pub fn new_element_with_text(name: &str, attrs: &[(&str, &str)], text: &str) -> Result<NodeRef> {
    let node = new_element(name, attrs)?;
    node.append(NodeRef::new_text(text));
    Ok(node)
}
