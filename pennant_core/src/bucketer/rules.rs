use regex::Regex;
use semver::Version;

use crate::snapshot::{
    Condition, ConditionOperator, ConditionValue, EnvSnapshot, Rule, Value,
};
use crate::{AttributeValue, UserContext};

/// Segment references may nest; the compiler rejects cycles, but snapshots
/// that bypassed compilation (hand-written offline files) must not be able
/// to stack-overflow the evaluator.
const MAX_SEGMENT_DEPTH: u8 = 8;

impl Rule {
    /// All conditions must hold. An empty condition list matches everyone.
    pub(crate) fn matches(&self, snapshot: &EnvSnapshot, user: &UserContext) -> bool {
        self.conditions
            .iter()
            .all(|condition| condition.matches(snapshot, user, 0))
    }
}

impl Condition {
    fn matches(&self, snapshot: &EnvSnapshot, user: &UserContext, depth: u8) -> bool {
        // `user_key` is addressable from rules without the caller having to
        // duplicate it into the attribute bag.
        let user_key_value;
        let attribute = match user.attributes.get(&self.attribute) {
            Some(value) => Some(value),
            None if self.attribute == "user_key" && !user.user_key.is_empty() => {
                user_key_value = AttributeValue::String(user.user_key.clone());
                Some(&user_key_value)
            }
            None => None,
        };

        match self.operator {
            ConditionOperator::Segment => {
                self.matches_segment(snapshot, user, depth).unwrap_or(false)
            }
            ConditionOperator::Exists => {
                !matches!(attribute, None | Some(AttributeValue::Null))
            }
            ConditionOperator::NotExists => {
                matches!(attribute, None | Some(AttributeValue::Null))
            }
            operator => operator.try_eval(attribute, &self.value).unwrap_or(false),
        }
    }

    fn matches_segment(
        &self,
        snapshot: &EnvSnapshot,
        user: &UserContext,
        depth: u8,
    ) -> Option<bool> {
        if depth >= MAX_SEGMENT_DEPTH {
            log::warn!(target: "pennant",
                       attribute:display = self.attribute;
                       "segment nesting exceeds maximum depth; condition treated as non-matching");
            return None;
        }
        let key = match &self.value {
            ConditionValue::Single(Value::String(key)) => key,
            _ => return None,
        };
        let segment = snapshot.segments.get(key)?;
        Some(
            segment
                .conditions
                .iter()
                .all(|condition| condition.matches(snapshot, user, depth + 1)),
        )
    }
}

impl ConditionOperator {
    /// Applying the operator to the values. Returns `false` if the operator
    /// cannot be applied or there's a misconfiguration.
    #[cfg(test)]
    pub(crate) fn eval(
        &self,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
    ) -> bool {
        self.try_eval(attribute, condition_value).unwrap_or(false)
    }

    /// Try applying the operator, returning `None` if it cannot be applied.
    /// Missing attributes land here as `None` and fail every operator
    /// (`exists`/`not_exists` are handled before this point).
    fn try_eval(
        &self,
        attribute: Option<&AttributeValue>,
        condition_value: &ConditionValue,
    ) -> Option<bool> {
        match self {
            Self::Eq | Self::Neq => {
                let attribute = attribute?.to_text()?;
                let expected = single_text(condition_value)?;
                Some((attribute == expected) == (*self == Self::Eq))
            }

            Self::In | Self::Nin => {
                let attribute = attribute?.to_text()?;
                let values = match condition_value {
                    ConditionValue::Multiple(v) => v,
                    _ => return None,
                };
                let is_member = values.iter().any(|v| v == &attribute);
                Some(is_member == (*self == Self::In))
            }

            Self::Contains | Self::StartsWith | Self::EndsWith => {
                let attribute = attribute?.to_text()?;
                let needle = single_text(condition_value)?;
                Some(match self {
                    Self::Contains => attribute.contains(&needle),
                    Self::StartsWith => attribute.starts_with(&needle),
                    Self::EndsWith => attribute.ends_with(&needle),
                    _ => unreachable!(),
                })
            }

            Self::Lt | Self::Lte | Self::Gt | Self::Gte => {
                let attribute = attribute?.to_number()?;
                let expected = match condition_value {
                    ConditionValue::Single(Value::Number(n)) => *n,
                    ConditionValue::Single(Value::String(s)) => s.parse().ok()?,
                    _ => return None,
                };
                Some(match self {
                    Self::Lt => attribute < expected,
                    Self::Lte => attribute <= expected,
                    Self::Gt => attribute > expected,
                    Self::Gte => attribute >= expected,
                    _ => unreachable!(),
                })
            }

            Self::Regex => {
                let attribute = attribute?.to_text()?;
                let pattern = match condition_value {
                    ConditionValue::Single(Value::String(s)) => s,
                    _ => return None,
                };
                let regex = Regex::new(pattern).ok()?;
                Some(regex.is_match(&attribute))
            }

            Self::SemverEq | Self::SemverGt | Self::SemverGte | Self::SemverLt
            | Self::SemverLte => {
                let attribute = Version::parse(attribute?.as_str()?).ok()?;
                let expected = match condition_value {
                    ConditionValue::Single(Value::String(s)) => Version::parse(s).ok()?,
                    _ => return None,
                };
                Some(match self {
                    Self::SemverEq => attribute == expected,
                    Self::SemverGt => attribute > expected,
                    Self::SemverGte => attribute >= expected,
                    Self::SemverLt => attribute < expected,
                    Self::SemverLte => attribute <= expected,
                    _ => unreachable!(),
                })
            }

            // Handled structurally before try_eval.
            Self::Segment | Self::Exists | Self::NotExists => None,
        }
    }
}

/// Stringified form of a single condition value; byte-exact comparisons
/// happen against this.
fn single_text(value: &ConditionValue) -> Option<String> {
    match value {
        ConditionValue::Single(Value::String(s)) => Some(s.clone()),
        ConditionValue::Single(Value::Number(n)) => Some(n.to_string()),
        ConditionValue::Single(Value::Boolean(b)) => Some(b.to_string()),
        _ => None,
    }
}
