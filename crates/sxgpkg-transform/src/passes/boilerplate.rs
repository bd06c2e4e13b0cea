use super::{TransformContext, TransformPass};
use crate::amp::{
    Format, AMP4ADS_AND_AMP4EMAIL_BOILERPLATE_CSS, AMP_BOILERPLATE_CSS,
    AMP_BOILERPLATE_NOSCRIPT_CSS, AMP_CUSTOM, NO_BOILERPLATE,
};
use crate::dom::{elements, has_attr, is_element, new_element, new_element_with_text};
use crate::error::Result;

/// Replaces whatever boilerplate the author wrote with the canonical one.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmpBoilerplate;

impl TransformPass for AmpBoilerplate {
    fn name(&self) -> &'static str {
        "ampboilerplate"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        // Already server-side rendered without boilerplate.
        if has_attr(&ctx.dom.html, NO_BOILERPLATE) {
            return Ok(());
        }
        let head = &ctx.dom.head;
        for node in elements(head) {
            let stale = (is_element(&node, "style") && !has_attr(&node, AMP_CUSTOM))
                || is_element(&node, "noscript");
            if stale {
                node.detach();
            }
        }

        let format = Format::of(&ctx.dom.html);
        let marker = format.boilerplate_attr();
        let css = match format {
            Format::Amp => AMP_BOILERPLATE_CSS,
            Format::Amp4Ads | Format::Amp4Email => AMP4ADS_AND_AMP4EMAIL_BOILERPLATE_CSS,
        };
        head.append(new_element_with_text("style", &[(marker, "")], css)?);

        if format == Format::Amp {
            let noscript = new_element("noscript", &[])?;
            noscript.append(new_element_with_text(
                "style",
                &[(marker, "")],
                AMP_BOILERPLATE_NOSCRIPT_CSS,
            )?);
            head.append(noscript);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::test_support::{assert_idempotent, run};

    #[test]
    fn replaces_author_boilerplate() {
        let out = run(
            &AmpBoilerplate,
            concat!(
                "<html amp><head><style amp-boilerplate>old</style>",
                "<noscript><style amp-boilerplate>old</style></noscript>",
                "<style amp-custom>p{}</style></head><body></body></html>"
            ),
        );
        assert!(!out.contains(">old<"));
        assert!(out.contains("<style amp-custom=\"\">p{}</style>"));
        assert!(out.contains(&format!(
            "<style amp-boilerplate=\"\">{}</style>",
            AMP_BOILERPLATE_CSS
        )));
        assert!(out.contains(&format!(
            "<noscript><style amp-boilerplate=\"\">{}</style></noscript>",
            AMP_BOILERPLATE_NOSCRIPT_CSS
        )));
    }

    #[test]
    fn amp4ads_has_no_noscript() {
        let out = run(&AmpBoilerplate, "<html amp4ads><head></head><body></body></html>");
        assert!(out.contains("<style amp4ads-boilerplate=\"\">body{visibility:hidden}</style>"));
        assert!(!out.contains("noscript"));
    }

    #[test]
    fn leaves_server_rendered_documents_alone() {
        let page = "<html amp i-amphtml-no-boilerplate><head></head><body></body></html>";
        assert!(!run(&AmpBoilerplate, page).contains("amp-boilerplate"));
    }

    #[test]
    fn is_idempotent() {
        assert_idempotent(
            &AmpBoilerplate,
            "<html amp><head><style>x</style></head><body></body></html>",
        );
    }
}
