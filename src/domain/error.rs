use thiserror::Error;

/// Reasons a batch is refused before any filesystem work happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchRejection {
    #[error("At least one plugin is required")]
    NoUnits,
    #[error("Maximum {max} plugins per request")]
    TooManyUnits { submitted: usize, max: usize },
    #[error("Maximum {max} shared includes per request")]
    TooManyIncludes { submitted: usize, max: usize },
}

impl BatchRejection {
    /// Number of items the client sent, for rejections caused by a count limit.
    pub fn submitted(&self) -> Option<usize> {
        match self {
            Self::NoUnits => None,
            Self::TooManyUnits { submitted, .. } | Self::TooManyIncludes { submitted, .. } => {
                Some(*submitted)
            }
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::NoUnits => None,
            Self::TooManyUnits { max, .. } | Self::TooManyIncludes { max, .. } => Some(*max),
        }
    }
}
