//! Server-side AMP layout.
//!
//! Performs the sizing calculations the AMP runtime would do on the client
//! and records them as classes, styles and `<i-amphtml-sizer>` children.

use std::fmt;

use kuchikiki::NodeRef;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::amp::{in_template, is_amp_custom_element, AMP_AUDIO, I_AMPHTML_LAYOUT};
use crate::dom::{append_attr, attr, new_element, remove_attr, set_attr, tag_name};

static CSS_LENGTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^((?:\d*\.)?\d+)(\D*)$").expect("Invalid regex pattern"));

const ACCEPTED_UNITS: &[&str] = &["em", "px", "rem", "vh", "vw", "vmin", "vmax"];
const DEFAULT_UNIT: &str = "px";
const SIZE_DEFINED_CLASS: &str = "i-amphtml-layout-size-defined";

// ===== Lengths =====

/// A parsed `width` or `height` attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct CssLength {
    pub is_set: bool,
    pub is_auto: bool,
    pub is_fluid: bool,
    pub value: f64,
    pub unit: String,
}

impl Default for CssLength {
    fn default() -> Self {
        Self {
            is_set: false,
            is_auto: false,
            is_fluid: false,
            value: 0.0,
            unit: DEFAULT_UNIT.to_string(),
        }
    }
}

impl CssLength {
    fn px(value: f64) -> Self {
        Self {
            is_set: true,
            value,
            ..Self::default()
        }
    }

    /// Parses an optional attribute value.
    pub fn parse(input: Option<&str>, allow_auto: bool, allow_fluid: bool) -> Result<Self, String> {
        let mut result = Self::default();
        let Some(input) = input else {
            return Ok(result);
        };
        result.is_set = true;
        match input {
            "auto" => {
                if !allow_auto {
                    return Err("auto is not allowed here".to_string());
                }
                result.is_auto = true;
            }
            "fluid" => {
                if !allow_fluid {
                    return Err("fluid is not allowed here".to_string());
                }
                result.is_fluid = true;
            }
            _ => {
                let caps = CSS_LENGTH
                    .captures(input)
                    .ok_or_else(|| format!("invalid length {:?}", input))?;
                result.value = caps[1]
                    .parse()
                    .map_err(|e| format!("invalid length {:?}: {}", input, e))?;
                let unit = &caps[2];
                if !unit.is_empty() {
                    if !ACCEPTED_UNITS.contains(&unit) {
                        return Err(format!("unit {:?} is not valid", unit));
                    }
                    result.unit = unit.to_string();
                }
            }
        }
        Ok(result)
    }

    /// Renders `dimension:<value><unit>;`, or nothing when unset.
    fn style(&self, dimension: &str) -> String {
        if !self.is_set {
            String::new()
        } else if self.is_auto {
            format!("{}:auto;", dimension)
        } else {
            format!("{}:{}{};", dimension, self.value, self.unit)
        }
    }
}

// ===== Layouts =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Unknown,
    Nodisplay,
    Fixed,
    FixedHeight,
    Responsive,
    Container,
    Fill,
    FlexItem,
    Fluid,
    Intrinsic,
}

impl Layout {
    /// Parses a `layout` attribute. Anything unrecognized is `Unknown`.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("nodisplay") => Layout::Nodisplay,
            Some("fixed") => Layout::Fixed,
            Some("fixed-height") => Layout::FixedHeight,
            Some("responsive") => Layout::Responsive,
            Some("container") => Layout::Container,
            Some("fill") => Layout::Fill,
            Some("flex-item") => Layout::FlexItem,
            Some("fluid") => Layout::Fluid,
            Some("intrinsic") => Layout::Intrinsic,
            _ => Layout::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Layout::Unknown => "",
            Layout::Nodisplay => "nodisplay",
            Layout::Fixed => "fixed",
            Layout::FixedHeight => "fixed-height",
            Layout::Responsive => "responsive",
            Layout::Container => "container",
            Layout::Fill => "fill",
            Layout::FlexItem => "flex-item",
            Layout::Fluid => "fluid",
            Layout::Intrinsic => "intrinsic",
        }
    }

    /// Whether the layout can be rendered on the server.
    pub fn is_supported(self) -> bool {
        !matches!(self, Layout::Unknown | Layout::Fluid | Layout::Intrinsic)
    }

    /// Whether the layout has an intrinsic size.
    pub fn has_size_definition(self) -> bool {
        !matches!(self, Layout::Unknown | Layout::Nodisplay | Layout::Container)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Dimensions {
    width: CssLength,
    height: CssLength,
}

fn normalized_width(tag: &str, value: Option<&str>, layout: Layout) -> Result<CssLength, String> {
    let width = CssLength::parse(value, true, false)?;
    if width.is_set || !matches!(layout, Layout::Unknown | Layout::Fixed) {
        return Ok(width);
    }
    Ok(match tag {
        "amp-analytics" | "amp-pixel" => CssLength::px(1.0),
        "amp-social-share" => CssLength::px(60.0),
        _ => width,
    })
}

fn normalized_height(tag: &str, value: Option<&str>, layout: Layout) -> Result<CssLength, String> {
    let height = CssLength::parse(value, true, layout == Layout::Fluid)?;
    if height.is_set
        || !matches!(layout, Layout::Unknown | Layout::Fixed | Layout::FixedHeight)
    {
        return Ok(height);
    }
    Ok(match tag {
        "amp-analytics" | "amp-pixel" => CssLength::px(1.0),
        "amp-social-share" => CssLength::px(44.0),
        _ => height,
    })
}

fn normalized_layout(
    layout: Layout,
    dims: &Dimensions,
    has_sizes: bool,
    has_heights: bool,
) -> Result<Layout, String> {
    let (w, h) = (&dims.width, &dims.height);
    let result = if layout != Layout::Unknown {
        layout
    } else if !w.is_set && !h.is_set {
        Layout::Container
    } else if (h.is_set && h.is_fluid) || (w.is_set && w.is_fluid) {
        Layout::Fluid
    } else if h.is_set && (!w.is_set || w.is_auto) {
        Layout::FixedHeight
    } else if h.is_set && w.is_set && (has_sizes || has_heights) {
        Layout::Responsive
    } else {
        Layout::Fixed
    };
    if !result.is_supported() {
        return Err(format!("layout {:?} is not supported", result.name()));
    }
    Ok(result)
}

/// Applies the layout algorithm to an `amp-*` element.
///
/// `amp-audio` and anything inside `<template>` are left alone. Returns an
/// error when the element's layout cannot be rendered on the server.
pub fn apply_layout(node: &NodeRef) -> Result<(), String> {
    if !is_amp_custom_element(node) || in_template(node) {
        return Ok(());
    }
    let tag = tag_name(node).unwrap_or_default();
    if tag == AMP_AUDIO {
        return Ok(());
    }

    let input = Layout::parse(attr(node, "layout").as_deref());
    let dims = Dimensions {
        width: normalized_width(&tag, attr(node, "width").as_deref(), input)?,
        height: normalized_height(&tag, attr(node, "height").as_deref(), input)?,
    };
    let layout = normalized_layout(
        input,
        &dims,
        attr(node, "sizes").is_some(),
        attr(node, "heights").is_some(),
    )?;

    let mut class = format!("{}-{}", I_AMPHTML_LAYOUT, layout);
    if layout.has_size_definition() {
        class.push(' ');
        class.push_str(SIZE_DEFINED_CLASS);
    }
    append_attr(node, "class", &class, " ");

    let styles = match layout {
        Layout::Nodisplay => {
            set_attr(node, "hidden", "hidden");
            String::new()
        }
        Layout::Fixed | Layout::FlexItem => {
            dims.width.style("width") + &dims.height.style("height")
        }
        Layout::FixedHeight => dims.height.style("height"),
        _ => String::new(),
    };
    if !styles.is_empty() {
        append_attr(node, "style", &styles, ";");
    }
    if attr(node, "style").is_some_and(|s| s.is_empty()) {
        remove_attr(node, "style");
    }
    set_attr(node, I_AMPHTML_LAYOUT, layout.name());

    let (w, h) = (&dims.width, &dims.height);
    if layout != Layout::Responsive
        || !w.is_set
        || w.value == 0.0
        || !h.is_set
        || h.unit != w.unit
    {
        return Ok(());
    }
    let padding = h.value / w.value * 100.0;
    let sizer_style = format!("display:block;padding-top:{:.4}%;", padding);
    let sizer = new_element("i-amphtml-sizer", &[("style", &sizer_style)])
        .map_err(|e| e.to_string())?;
    node.prepend(sizer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{is_element, Dom};

    fn laid_out(markup: &str) -> NodeRef {
        let dom = Dom::parse(markup).unwrap();
        let node = dom
            .body
            .descendants()
            .find(is_amp_custom_element)
            .unwrap();
        apply_layout(&node).unwrap();
        node
    }

    #[test]
    fn parses_css_lengths() {
        let len = CssLength::parse(Some("10.5rem"), false, false).unwrap();
        assert_eq!(len.value, 10.5);
        assert_eq!(len.unit, "rem");

        let px = CssLength::parse(Some("42"), false, false).unwrap();
        assert_eq!(px.unit, "px");

        assert!(CssLength::parse(Some("auto"), false, false).is_err());
        assert!(CssLength::parse(Some("auto"), true, false).unwrap().is_auto);
        assert!(CssLength::parse(Some("fluid"), false, false).is_err());
        assert!(CssLength::parse(Some("10furlongs"), true, true).is_err());
        assert!(!CssLength::parse(None, true, true).unwrap().is_set);
    }

    #[test]
    fn fixed_layout_gets_width_and_height() {
        let node = laid_out(r#"<amp-img width="300" height="200" src="a.png"></amp-img>"#);
        assert_eq!(attr(&node, "i-amphtml-layout").as_deref(), Some("fixed"));
        assert_eq!(
            attr(&node, "class").as_deref(),
            Some("i-amphtml-layout-fixed i-amphtml-layout-size-defined")
        );
        assert_eq!(
            attr(&node, "style").as_deref(),
            Some("width:300px;height:200px;")
        );
    }

    #[test]
    fn responsive_layout_gets_sizer() {
        let node = laid_out(
            r#"<amp-img layout="responsive" width="400" height="300" src="a.png"></amp-img>"#,
        );
        assert_eq!(attr(&node, "i-amphtml-layout").as_deref(), Some("responsive"));
        assert!(attr(&node, "style").is_none());
        let sizer = node.first_child().unwrap();
        assert!(is_element(&sizer, "i-amphtml-sizer"));
        assert_eq!(
            attr(&sizer, "style").as_deref(),
            Some("display:block;padding-top:75.0000%;")
        );
    }

    #[test]
    fn default_sizes_for_pixels() {
        let node = laid_out(r#"<amp-pixel src="https://example.com/p"></amp-pixel>"#);
        assert_eq!(attr(&node, "style").as_deref(), Some("width:1px;height:1px;"));
    }

    #[test]
    fn height_only_is_fixed_height() {
        let node = laid_out(r#"<amp-carousel height="300"></amp-carousel>"#);
        assert_eq!(attr(&node, "i-amphtml-layout").as_deref(), Some("fixed-height"));
        assert_eq!(attr(&node, "style").as_deref(), Some("height:300px;"));
    }

    #[test]
    fn nothing_set_is_container() {
        let node = laid_out("<amp-accordion></amp-accordion>");
        assert_eq!(attr(&node, "i-amphtml-layout").as_deref(), Some("container"));
        assert_eq!(attr(&node, "class").as_deref(), Some("i-amphtml-layout-container"));
    }

    #[test]
    fn nodisplay_is_hidden() {
        let node = laid_out(r#"<amp-lightbox layout="nodisplay"></amp-lightbox>"#);
        assert_eq!(attr(&node, "hidden").as_deref(), Some("hidden"));
    }

    #[test]
    fn unsupported_layouts_are_errors() {
        let dom = Dom::parse(r#"<amp-img layout="intrinsic" width="1" height="1"></amp-img>"#)
            .unwrap();
        let node = dom.body.descendants().find(is_amp_custom_element).unwrap();
        assert!(apply_layout(&node).is_err());
    }

    #[test]
    fn amp_audio_is_skipped() {
        let node = laid_out(r#"<amp-audio width="100" height="20"></amp-audio>"#);
        assert!(attr(&node, "i-amphtml-layout").is_none());
    }
}
