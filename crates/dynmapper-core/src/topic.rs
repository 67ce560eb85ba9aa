//! Topic matcher.
//!
//! Topics are `/` separated. Patterns may use `+` for exactly one level and a
//! trailing `#` for zero or more levels. Separators are significant: they are
//! kept as their own `"/"` tokens when splitting with separators, so `"/a"`
//! and `"a"` are different topics.

use crate::error::{Error, Result};
use crate::validation::ValidationError;

pub const SEPARATOR: &str = "/";
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Collapse separator runs and absorb a separator trailing `#`.
///
/// `"///rom/hamburg/madrid/+//"` becomes `"/rom/hamburg/madrid/+/"` and
/// `"/rom/hamburg/madrid/#/"` becomes `"/rom/hamburg/madrid/#"`.
pub fn normalize(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    let mut last_was_separator = false;
    for c in topic.chars() {
        if c == '/' {
            if !last_was_separator {
                out.push(c);
            }
            last_was_separator = true;
        } else {
            out.push(c);
            last_was_separator = false;
        }
    }
    if out.ends_with("#/") {
        out.pop();
    }
    out
}

/// Split a topic into tokens.
///
/// With `include_separators` every separator is its own `"/"` token, otherwise
/// only the non-empty levels are returned.
pub fn split_levels(topic: &str, include_separators: bool) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in topic.chars() {
        if c == '/' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if include_separators {
                tokens.push(SEPARATOR.to_string());
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Levels of a topic without separators, as injected into `_TOPIC_LEVEL_`.
pub fn topic_levels(topic: &str) -> Vec<String> {
    split_levels(&normalize(topic), false)
}

/// Match a concrete topic against a wildcard pattern.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let pattern = split_levels(&normalize(pattern), true);
    let topic = split_levels(&normalize(topic), true);
    match_tokens(&pattern, &topic)
}

fn match_tokens(pattern: &[String], topic: &[String]) -> bool {
    let Some(head) = pattern.first() else {
        return topic.is_empty();
    };
    if head == MULTI_LEVEL_WILDCARD {
        return true;
    }
    let Some(level) = topic.first() else {
        // "a/b/#" also matches "a/b"
        return pattern.len() == 2 && pattern[0] == SEPARATOR && pattern[1] == MULTI_LEVEL_WILDCARD;
    };
    if head == SINGLE_LEVEL_WILDCARD {
        level != SEPARATOR && match_tokens(&pattern[1..], &topic[1..])
    } else {
        head == level && match_tokens(&pattern[1..], &topic[1..])
    }
}

/// Wildcard placement violations of a pattern.
pub fn validate_pattern(pattern: &str) -> Vec<ValidationError> {
    let mut violations = Vec::new();
    let levels = split_levels(&normalize(pattern), false);
    let last = levels.len().saturating_sub(1);
    for (i, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains('+') || level.contains('#');
        if has_wildcard && level != SINGLE_LEVEL_WILDCARD && level != MULTI_LEVEL_WILDCARD {
            push_once(&mut violations, ValidationError::WildcardMustOccupyWholeLevel);
        }
        if level == MULTI_LEVEL_WILDCARD && i != last {
            push_once(&mut violations, ValidationError::MultiLevelWildcardOnlyAtEnd);
        }
    }
    violations
}

/// Reject a pattern that cannot be placed in the resolver tree.
pub fn check_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidTopic {
            topic: pattern.to_string(),
            reason: "empty pattern".to_string(),
        });
    }
    match validate_pattern(pattern).first() {
        Some(violation) => Err(Error::InvalidTopic {
            topic: pattern.to_string(),
            reason: violation.to_string(),
        }),
        None => Ok(()),
    }
}

/// Check that a template topic is a structurally compatible concretion of
/// the subscription topic.
///
/// A concrete template level may stand where the subscription has `+`; level
/// counts must agree unless the subscription ends in `#`.
pub fn is_structurally_compatible(template_topic: &str, subscription_topic: &str) -> Vec<ValidationError> {
    let template = split_levels(&normalize(template_topic), true);
    let subscription = split_levels(&normalize(subscription_topic), true);

    let open_ended = subscription.iter().any(|s| s == MULTI_LEVEL_WILDCARD);
    for (i, sub) in subscription.iter().enumerate() {
        if sub == MULTI_LEVEL_WILDCARD {
            return Vec::new();
        }
        let Some(tpl) = template.get(i) else {
            // a template shorter than the part before "#" cannot match
            if open_ended {
                return vec![ValidationError::TemplateTopicMustMatchSubscriptionTopic];
            }
            return vec![ValidationError::TemplateTopicLevelCountMismatch];
        };
        let compatible = if sub == SINGLE_LEVEL_WILDCARD {
            tpl != SEPARATOR
        } else {
            tpl == sub
        };
        if !compatible {
            return vec![ValidationError::TemplateTopicMustMatchSubscriptionTopic];
        }
    }

    if template.len() != subscription.len() {
        return vec![ValidationError::TemplateTopicLevelCountMismatch];
    }
    Vec::new()
}

/// Check a sample topic against the template topic.
pub fn is_sample_compatible(template_topic: &str, sample: &str) -> Vec<ValidationError> {
    let template = split_levels(&normalize(template_topic), true);
    let sample = split_levels(&normalize(sample), true);

    let open_ended = template.iter().any(|t| t == MULTI_LEVEL_WILDCARD);
    if !open_ended && template.len() != sample.len() {
        return vec![ValidationError::TemplateTopicSampleLevelCountMismatch];
    }

    for (i, tpl) in template.iter().enumerate() {
        if tpl == MULTI_LEVEL_WILDCARD {
            break;
        }
        let Some(level) = sample.get(i) else {
            return vec![ValidationError::TemplateTopicSampleLevelCountMismatch];
        };
        let compatible = if tpl == SINGLE_LEVEL_WILDCARD {
            level != SEPARATOR
        } else {
            tpl == level
        };
        if !compatible {
            return vec![ValidationError::TemplateTopicSampleStructureMismatch];
        }
    }
    Vec::new()
}

/// Re-splice topic levels into a topic pattern.
///
/// Each non-separator token of `pattern` is replaced by the next entry of
/// `levels`; tokens without a replacement are kept.
pub fn splice_levels(pattern: &str, levels: &[String]) -> String {
    let mut next = levels.iter();
    split_levels(pattern, true)
        .into_iter()
        .map(|token| {
            if token == SEPARATOR {
                token
            } else {
                next.next().cloned().unwrap_or(token)
            }
        })
        .collect()
}

fn push_once(violations: &mut Vec<ValidationError>, violation: ValidationError) {
    if !violations.contains(&violation) {
        violations.push(violation);
    }
}
