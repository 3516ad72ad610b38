//! Topic construction and wildcard validation
//!
//! A topic is `password/channel/sub1/sub2/...`. The password acts as a namespace so
//! that only clients sharing it meet on the same broker tree. Subchannels may use the
//! two MQTT wildcards:
//!
//! ```text
//! players/+/movement   +  matches exactly one level, allowed in any subchannel
//! players/player1/#    #  matches every remaining level, last subchannel only
//! ```
//!
//! Validation is a pure function of the whole subchannel list, so it can be re-run
//! every time the list is edited instead of caching a verdict.

use super::error::SyncError;
use std::fmt;

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Immutable, validated topic string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    /// Joins password, channel and subchannels after validating every segment
    pub fn build<S: AsRef<str>>(
        password: &str,
        channel: &str,
        subchannels: &[S],
    ) -> Result<Self, SyncError> {
        validate_identifier(password, "password")?;
        validate_identifier(channel, "channel")?;
        validate_subchannels(subchannels)?;

        let mut topic = format!("{}{}{}{}", password, SEPARATOR, channel, SEPARATOR);
        for sub in subchannels {
            topic.push_str(sub.as_ref());
            topic.push(SEPARATOR);
        }
        let topic = topic.trim_end_matches(SEPARATOR).to_string();

        Ok(Topic(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the topic back into its ordered segments
    pub fn segments(&self) -> Vec<&str> {
        self.0.split(SEPARATOR).collect()
    }

    /// True if the topic contains a wildcard and can only be subscribed to
    pub fn is_filter(&self) -> bool {
        self.segments()
            .iter()
            .any(|s| *s == SINGLE_LEVEL_WILDCARD || *s == MULTI_LEVEL_WILDCARD)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `[a-zA-Z0-9_-]+`, not starting or ending with `_` or `-`
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !value.starts_with(['_', '-'])
        && !value.ends_with(['_', '-'])
}

fn validate_identifier(value: &str, what: &str) -> Result<(), SyncError> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(invalid(
            value,
            &format!("{} must match [a-zA-Z0-9_-]+ without leading or trailing '_'/'-'", what),
        ))
    }
}

/// Checks a full subchannel list, including position-dependent wildcard rules
pub fn validate_subchannels<S: AsRef<str>>(subchannels: &[S]) -> Result<(), SyncError> {
    match subchannel_issues(subchannels).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One `InvalidTopicSegment` per bad subchannel, in list order
pub fn subchannel_issues<S: AsRef<str>>(subchannels: &[S]) -> Vec<SyncError> {
    let last = subchannels.len().saturating_sub(1);
    let mut issues = Vec::new();

    for (index, sub) in subchannels.iter().enumerate() {
        let sub = sub.as_ref();

        if sub == MULTI_LEVEL_WILDCARD {
            if index != last {
                issues.push(invalid(sub, "'#' is only allowed as the last subchannel"));
            }
            continue;
        }

        if sub == SINGLE_LEVEL_WILDCARD {
            continue;
        }

        if sub.contains(MULTI_LEVEL_WILDCARD) || sub.contains(SINGLE_LEVEL_WILDCARD) {
            issues.push(invalid(sub, "wildcards must stand alone in their segment"));
        } else if sub.is_empty() {
            issues.push(invalid(sub, "subchannel must not be empty"));
        } else if let Err(err) = validate_identifier(sub, "subchannel") {
            issues.push(err);
        }
    }

    issues
}

fn invalid(segment: &str, reason: &str) -> SyncError {
    SyncError::InvalidTopicSegment {
        segment: segment.to_string(),
        reason: reason.to_string(),
    }
}
