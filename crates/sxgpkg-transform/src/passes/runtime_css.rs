use super::{TransformContext, TransformPass};
use crate::amp::{AMP_CACHE_SCHEME_AND_HOST, AMP_RUNTIME};
use crate::dom::{has_attr, is_element, new_element, set_attr};
use crate::error::Result;

const VERSION_ATTR: &str = "i-amphtml-version";

/// Fills the `<style amp-runtime>` placeholder left by server-side rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmpRuntimeCss;

impl TransformPass for AmpRuntimeCss {
    fn name(&self) -> &'static str {
        "ampruntimecss"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let head = &ctx.dom.head;
        let Some(style) = head
            .children()
            .find(|c| is_element(c, "style") && has_attr(c, AMP_RUNTIME))
        else {
            return Ok(());
        };
        if has_attr(&style, VERSION_ATTR) {
            return Ok(());
        }

        let rtv = ctx.runtime_version.as_deref().filter(|v| !v.is_empty());
        set_attr(&style, VERSION_ATTR, rtv.unwrap_or("latest"));

        if let Some(css) = ctx.runtime_css.as_deref().filter(|c| !c.trim().is_empty()) {
            style.append(kuchikiki::NodeRef::new_text(css.trim()));
            return Ok(());
        }

        let href = match rtv {
            Some(rtv) => format!("{}/rtv/{}/v0.css", AMP_CACHE_SCHEME_AND_HOST, rtv),
            None => format!("{}/v0.css", AMP_CACHE_SCHEME_AND_HOST),
        };
        head.append(new_element("link", &[("rel", "stylesheet"), ("href", &href)])?);
        Ok(())
    }
}
