use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// A caller resolved from the request's session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self { user_id: user_id.into() }
    }
}

/// A user's current subscription, as reported by the plan directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum SubscriptionTier {
    /// The default plan every account starts on.
    Free { plan: String },
    /// Any plan other than the default.
    Paid { plan: String },
}

impl SubscriptionTier {
    #[must_use]
    pub fn plan(&self) -> &str {
        match self {
            Self::Free { plan } | Self::Paid { plan } => plan,
        }
    }

    #[must_use]
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid { .. })
    }
}
