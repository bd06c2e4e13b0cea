//! Transform registry and pipeline.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Result, TransformError};
use crate::passes::{
    AmpBoilerplate, AmpRuntimeCss, LinkTag, MetaTag, Normalize, ReorderHead,
    ServerSideRendering, TransformContext, TransformPass, TransformedIdentifier, UrlRewrite,
};

// =============================================================================
// Registry
// =============================================================================

/// A named, selectable transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transform {
    MetaTag,
    LinkTag,
    Url,
    AmpBoilerplate,
    ServerSideRendering,
    AmpRuntimeCss,
    TransformedIdentifier,
    ReorderHead,
}

impl Transform {
    /// Every transform, in default order.
    pub const ALL: [Transform; 8] = [
        Transform::MetaTag,
        Transform::LinkTag,
        Transform::Url,
        Transform::AmpBoilerplate,
        Transform::ServerSideRendering,
        Transform::AmpRuntimeCss,
        Transform::TransformedIdentifier,
        Transform::ReorderHead,
    ];

    /// The default pipeline.
    pub const DEFAULT: &'static [Transform] = &Self::ALL;

    /// The `validation` preset.
    pub const VALIDATION: &'static [Transform] = &[Transform::ReorderHead];

    /// Stable lowercase name, as used in configuration.
    pub fn name(self) -> &'static str {
        self.pass().name()
    }

    /// The implementation of this transform.
    pub fn pass(self) -> &'static dyn TransformPass {
        match self {
            Transform::MetaTag => &MetaTag,
            Transform::LinkTag => &LinkTag,
            Transform::Url => &UrlRewrite,
            Transform::AmpBoilerplate => &AmpBoilerplate,
            Transform::ServerSideRendering => &ServerSideRendering,
            Transform::AmpRuntimeCss => &AmpRuntimeCss,
            Transform::TransformedIdentifier => &TransformedIdentifier,
            Transform::ReorderHead => &ReorderHead,
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Transform::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| TransformError::UnknownTransform(s.to_string()))
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// A validated, ordered list of transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    transforms: Vec<Transform>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            transforms: Transform::DEFAULT.to_vec(),
        }
    }
}

impl Pipeline {
    /// Builds a pipeline, checking the ordering contract.
    pub fn new(transforms: Vec<Transform>) -> Result<Self> {
        check_order(&transforms)?;
        Ok(Self { transforms })
    }

    /// Resolves configured names.
    ///
    /// A single `default`, `none` or `validation` selects that preset.
    /// Anything else is a custom list of transform names.
    pub fn resolve<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if let [only] = names {
            match only.as_ref().trim().to_ascii_lowercase().as_str() {
                "default" => return Ok(Self::default()),
                "none" => return Ok(Self::none()),
                "validation" => return Self::new(Transform::VALIDATION.to_vec()),
                _ => {}
            }
        }
        let transforms = names
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<Transform>>>()?;
        Self::new(transforms)
    }

    /// Resolves an optional configured list; unset means the default pipeline.
    pub fn from_config(names: Option<&[String]>) -> Result<Self> {
        match names {
            Some(names) => Self::resolve(names),
            None => Ok(Self::default()),
        }
    }

    /// A pipeline that only normalizes.
    pub fn none() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Runs normalization and then every pass in order.
    pub fn run(&self, ctx: &mut TransformContext) -> Result<()> {
        Normalize.apply(ctx)?;
        for transform in &self.transforms {
            debug!("Running transform {}", transform);
            transform.pass().apply(ctx)?;
        }
        Ok(())
    }
}

fn check_order(transforms: &[Transform]) -> Result<()> {
    let position = |t: Transform| transforms.iter().position(|x| *x == t);

    for (i, t) in transforms.iter().enumerate() {
        if transforms[..i].contains(t) {
            return Err(TransformError::OrderViolation(format!("{} listed twice", t)));
        }
    }

    let must_precede = [
        (Transform::AmpBoilerplate, Transform::ServerSideRendering),
        (Transform::ServerSideRendering, Transform::AmpRuntimeCss),
    ];
    for (first, second) in must_precede {
        if let (Some(a), Some(b)) = (position(first), position(second)) {
            if a > b {
                return Err(TransformError::OrderViolation(format!(
                    "{} must run before {}",
                    first, second
                )));
            }
        }
    }

    if let Some(id) = position(Transform::TransformedIdentifier) {
        if let Some(later) = transforms[id + 1..]
            .iter()
            .find(|t| **t != Transform::ReorderHead)
        {
            return Err(TransformError::OrderViolation(format!(
                "{} must run after {}",
                Transform::TransformedIdentifier,
                later
            )));
        }
    }

    if let Some(reorder) = position(Transform::ReorderHead) {
        if reorder + 1 != transforms.len() {
            return Err(TransformError::OrderViolation(format!(
                "{} must run last",
                Transform::ReorderHead
            )));
        }
    }
    Ok(())
}
