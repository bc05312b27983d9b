use serde::{Deserialize, Serialize};

use crate::Attributes;

/// Input to a single evaluation: the identity being bucketed and its
/// attribute bag.
///
/// `user_key` is the stable identity the bucketing hash is derived from; it
/// must be non-empty for any non-error result. Attributes carry no ownership
/// beyond the evaluation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub user_key: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl UserContext {
    /// A context with no attributes.
    pub fn new(user_key: impl Into<String>) -> Self {
        UserContext {
            user_key: user_key.into(),
            attributes: Attributes::new(),
            session_id: None,
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}
