//! AMP markup constants and element predicates.

use kuchikiki::NodeRef;

use crate::dom::{attr, has_attr, is_descendant_of, is_element};

pub const AMP_AUDIO: &str = "amp-audio";
pub const AMP_BOILERPLATE: &str = "amp-boilerplate";
pub const AMP4ADS_BOILERPLATE: &str = "amp4ads-boilerplate";
pub const AMP4EMAIL_BOILERPLATE: &str = "amp4email-boilerplate";
pub const AMP_CUSTOM: &str = "amp-custom";
pub const AMP_RUNTIME: &str = "amp-runtime";
pub const AMP_EXPERIMENT: &str = "amp-experiment";
pub const AMP_STORY: &str = "amp-story";
pub const AMP_DYNAMIC_CSS_CLASSES: &str = "amp-dynamic-css-classes";
pub const I_AMPHTML_LAYOUT: &str = "i-amphtml-layout";
pub const NO_BOILERPLATE: &str = "i-amphtml-no-boilerplate";

/// Scheme and host of the AMP cache CDN.
pub const AMP_CACHE_SCHEME_AND_HOST: &str = "https://cdn.ampproject.org";

/// The standard boilerplate that hides the body until the runtime loads.
pub const AMP_BOILERPLATE_CSS: &str = "body{-webkit-animation:-amp-start 8s steps(1,end) 0s 1 normal both;-moz-animation:-amp-start 8s steps(1,end) 0s 1 normal both;-ms-animation:-amp-start 8s steps(1,end) 0s 1 normal both;animation:-amp-start 8s steps(1,end) 0s 1 normal both}@-webkit-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@-moz-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@-ms-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@-o-keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}@keyframes -amp-start{from{visibility:hidden}to{visibility:visible}}";

/// Boilerplate override used when scripting is disabled.
pub const AMP_BOILERPLATE_NOSCRIPT_CSS: &str =
    "body{-webkit-animation:none;-moz-animation:none;-ms-animation:none;animation:none}";

/// Boilerplate for the ads and email formats.
pub const AMP4ADS_AND_AMP4EMAIL_BOILERPLATE_CSS: &str = "body{visibility:hidden}";

/// Extensions whose presence delays first render.
pub const RENDER_DELAYING_EXTENSIONS: &[&str] =
    &[AMP_DYNAMIC_CSS_CLASSES, AMP_EXPERIMENT, AMP_STORY];

/// Document format, from the attributes on `<html>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Amp,
    Amp4Ads,
    Amp4Email,
}

impl Format {
    pub fn of(html: &NodeRef) -> Self {
        if has_attr(html, "amp4ads") || has_attr(html, "⚡4ads") {
            Format::Amp4Ads
        } else if has_attr(html, "amp4email") || has_attr(html, "⚡4email") {
            Format::Amp4Email
        } else {
            Format::Amp
        }
    }

    /// Attribute marking this format's boilerplate `<style>`.
    pub fn boilerplate_attr(self) -> &'static str {
        match self {
            Format::Amp => AMP_BOILERPLATE,
            Format::Amp4Ads => AMP4ADS_BOILERPLATE,
            Format::Amp4Email => AMP4EMAIL_BOILERPLATE,
        }
    }
}

/// True for `amp-*` custom elements.
pub fn is_amp_custom_element(node: &NodeRef) -> bool {
    node.as_element()
        .is_some_and(|e| e.name.local.starts_with("amp-"))
}

/// True for any of the boilerplate `<style>` variants.
pub fn is_boilerplate_style(node: &NodeRef) -> bool {
    is_element(node, "style")
        && (has_attr(node, AMP_BOILERPLATE)
            || has_attr(node, AMP4ADS_BOILERPLATE)
            || has_attr(node, AMP4EMAIL_BOILERPLATE))
}

/// `<script async src=https://cdn.ampproject.org/.../v0.js>` and its module twin.
pub fn is_runtime_script(node: &NodeRef) -> bool {
    if !is_element(node, "script") || !has_attr(node, "async") {
        return false;
    }
    attr(node, "src").is_some_and(|src| {
        src.starts_with(AMP_CACHE_SCHEME_AND_HOST)
            && (src.ends_with("/v0.js") || src.ends_with("/v0.mjs"))
    })
}

/// `<script async src=https://cdn.ampproject.org/v0/amp-viewer-integration-*.js>`.
pub fn is_viewer_script(node: &NodeRef) -> bool {
    is_element(node, "script")
        && has_attr(node, "async")
        && attr(node, "src").is_some_and(|src| {
            src.starts_with(&format!(
                "{}/v0/amp-viewer-integration-",
                AMP_CACHE_SCHEME_AND_HOST
            ))
        })
}

/// Name of the extension a `<script custom-element|custom-template>` loads.
pub fn extension_name(node: &NodeRef) -> Option<String> {
    if !is_element(node, "script") {
        return None;
    }
    attr(node, "custom-element").or_else(|| attr(node, "custom-template"))
}

/// True for a head extension script that delays render.
pub fn is_render_delaying_script(node: &NodeRef) -> bool {
    extension_name(node).is_some_and(|n| RENDER_DELAYING_EXTENSIONS.contains(&n.as_str()))
}

/// True inside a `<template>`.
pub fn in_template(node: &NodeRef) -> bool {
    is_descendant_of(node, "template")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::new_element;

    #[test]
    fn detects_runtime_and_viewer_scripts() {
        let runtime = new_element(
            "script",
            &[("async", ""), ("src", "https://cdn.ampproject.org/v0.js")],
        )
        .unwrap();
        assert!(is_runtime_script(&runtime));

        let viewer = new_element(
            "script",
            &[
                ("async", ""),
                (
                    "src",
                    "https://cdn.ampproject.org/v0/amp-viewer-integration-0.1.js",
                ),
            ],
        )
        .unwrap();
        assert!(is_viewer_script(&viewer));
        assert!(!is_runtime_script(&viewer));
    }

    #[test]
    fn detects_render_delaying_extensions() {
        let story = new_element("script", &[("custom-element", "amp-story")]).unwrap();
        let carousel = new_element("script", &[("custom-element", "amp-carousel")]).unwrap();
        assert!(is_render_delaying_script(&story));
        assert!(!is_render_delaying_script(&carousel));
        assert_eq!(extension_name(&carousel).as_deref(), Some("amp-carousel"));
    }
}
