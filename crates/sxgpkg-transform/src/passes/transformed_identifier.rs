use super::{TransformContext, TransformPass};
use crate::dom::set_attr;
use crate::error::Result;

/// Marks `<html>` as transformed, e.g. `transformed="google;v=1"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformedIdentifier;

impl TransformPass for TransformedIdentifier {
    fn name(&self) -> &'static str {
        "transformedidentifier"
    }

    fn apply(&self, ctx: &mut TransformContext) -> Result<()> {
        let value = if ctx.version == 0 {
            "google".to_string()
        } else {
            format!("google;v={}", ctx.version)
        };
        set_attr(&ctx.dom.html, "transformed", value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::test_support::{assert_idempotent, context, run};

    #[test]
    fn stamps_version() {
        let out = run(&TransformedIdentifier, "<html amp><head></head><body></body></html>");
        assert!(out.contains("<html amp=\"\" transformed=\"google;v=1\">"));
    }

    #[test]
    fn version_zero_omits_parameter() {
        let mut ctx = context("<html><head></head><body></body></html>");
        ctx.version = 0;
        TransformedIdentifier.apply(&mut ctx).unwrap();
        assert!(ctx.dom.serialize().contains("transformed=\"google\""));
    }

    #[test]
    fn is_idempotent() {
        assert_idempotent(&TransformedIdentifier, "<html><head></head><body></body></html>");
    }
}
