use tch::TchError;
use thiserror::Error;

/// Main library error type.
#[derive(Error, Debug)]
pub enum NstError {
    /// A layer name that is not part of the encoder.
    #[error("unknown layer {layer}, available layers: {available}")]
    UnknownLayer { layer: String, available: String },

    /// An operator or criterion was used before its targets were set.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// A region name that is not part of a regional operator.
    #[error("unknown region {0}")]
    UnknownRegion(String),

    /// A regional target was set without any guide for this region.
    #[error("no guide associated with region {0}")]
    MissingGuide(String),

    /// Invalid shape.
    #[error("invalid shape: {0}")]
    Shape(String),

    /// Invalid configuration, e.g. an empty pyramid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Errors returned by tch.
    #[error(transparent)]
    Torch(#[from] TchError),

    /// An error annotated with the operator, region or layer it occurred in.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<NstError>,
    },
}

impl NstError {
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        NstError::Context { context: context.into(), source: Box::new(self) }
    }

    /// The innermost error, skipping all the context layers.
    pub fn root(&self) -> &NstError {
        match self {
            NstError::Context { source, .. } => source.root(),
            err => err,
        }
    }
}

pub type Result<T> = std::result::Result<T, NstError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_displayed_and_unwrapped() {
        let err = NstError::Shape("2x2 vs 3x3".to_string()).context("region sky").context("style");
        assert_eq!(err.to_string(), "style: region sky: invalid shape: 2x2 vs 3x3");
        assert!(matches!(err.root(), NstError::Shape(_)));
    }
}
