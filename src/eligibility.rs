//! Eligibility policy: which sources may be cloned.

use std::collections::BTreeSet;

/// Decides whether a source identifier may be cloned.
///
/// Self-cloning is checked separately by the registry against the host
/// identifier; a policy only expresses the denylist.
pub trait EligibilityPolicy: Send + Sync {
    fn is_eligible(&self, identifier: &str) -> bool;
}

impl<F> EligibilityPolicy for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_eligible(&self, identifier: &str) -> bool {
        self(identifier)
    }
}

/// Policy that rejects an explicit set of identifiers.
#[derive(Debug, Clone, Default)]
pub struct DenylistPolicy {
    denied: BTreeSet<String>,
}

impl DenylistPolicy {
    pub fn new<I, S>(denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: denied.into_iter().map(Into::into).collect(),
        }
    }

    /// Allow everything.
    pub fn allow_all() -> Self {
        Self::default()
    }
}

impl EligibilityPolicy for DenylistPolicy {
    fn is_eligible(&self, identifier: &str) -> bool {
        !self.denied.contains(identifier)
    }
}
