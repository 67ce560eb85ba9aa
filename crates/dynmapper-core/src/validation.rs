//! Mapping validation surface.
//!
//! Violations are collected and returned, never raised. The registry turns a
//! non-empty list into [`Error::Validation`](crate::Error::Validation) unless
//! the caller overrides validation.

use serde::{Deserialize, Serialize};

use crate::model::{Direction, Mapping};
use crate::topic;

/// A single mapping violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationError {
    #[error("Multi level wildcard '#' is only allowed as the last level of a topic")]
    MultiLevelWildcardOnlyAtEnd,

    #[error("Wildcards '+' and '#' must occupy a whole topic level")]
    WildcardMustOccupyWholeLevel,

    #[error("Template topic must match the subscription topic")]
    TemplateTopicMustMatchSubscriptionTopic,

    #[error("Template topic and subscription topic have a different number of levels")]
    TemplateTopicLevelCountMismatch,

    #[error("Template topic sample does not match the structure of the template topic")]
    TemplateTopicSampleStructureMismatch,

    #[error("Template topic sample and template topic have a different number of levels")]
    TemplateTopicSampleLevelCountMismatch,

    #[error("Subscription topic is already used by another mapping")]
    SubscriptionTopicNotUnique,

    #[error("Mapping has no substitution defining the device identifier")]
    IdentifierSubstitutionMissing,

    #[error("Only one substitution may define the device identifier")]
    MultipleIdentifierSubstitutions,

    #[error("Outbound mapping has no filter")]
    FilterOutboundMissing,

    #[error("Outbound mapping has no publish topic")]
    PublishTopicMissing,
}

/// Topic structure violations of a single mapping.
pub fn validate_topic_structure(mapping: &Mapping) -> Vec<ValidationError> {
    let mut violations = Vec::new();
    match mapping.direction {
        Direction::Inbound => {
            violations.extend(topic::validate_pattern(&mapping.subscription_topic));
            if !mapping.template_topic.is_empty() {
                violations.extend(topic::is_structurally_compatible(
                    &mapping.template_topic,
                    &mapping.subscription_topic,
                ));
                if !mapping.template_topic_sample.is_empty() {
                    violations.extend(topic::is_sample_compatible(
                        &mapping.template_topic,
                        &mapping.template_topic_sample,
                    ));
                }
            }
        }
        Direction::Outbound => {
            if mapping.filter_outbound.as_deref().map_or(true, str::is_empty) {
                violations.push(ValidationError::FilterOutboundMissing);
            }
            if mapping.publish_topic.is_empty() {
                violations.push(ValidationError::PublishTopicMissing);
            }
        }
    }
    violations
}

/// Violations caused by another inbound mapping using the same pattern.
pub fn validate_uniqueness(existing: &[Mapping], candidate: &Mapping) -> Vec<ValidationError> {
    if candidate.direction != Direction::Inbound {
        return Vec::new();
    }
    let pattern = candidate.pattern();
    let duplicate = existing.iter().any(|m| {
        m.id != candidate.id && m.direction == Direction::Inbound && m.pattern() == pattern
    });
    if duplicate {
        vec![ValidationError::SubscriptionTopicNotUnique]
    } else {
        Vec::new()
    }
}

/// Exactly one substitution must define the identifier.
pub fn validate_identifier(mapping: &Mapping) -> Vec<ValidationError> {
    match mapping.substitutions.iter().filter(|s| s.defines_identifier).count() {
        0 => vec![ValidationError::IdentifierSubstitutionMissing],
        1 => Vec::new(),
        _ => vec![ValidationError::MultipleIdentifierSubstitutions],
    }
}

/// All violations of `candidate` against the tenant's existing mappings.
pub fn validate_mapping(existing: &[Mapping], candidate: &Mapping) -> Vec<ValidationError> {
    let mut violations = validate_topic_structure(candidate);
    violations.extend(validate_uniqueness(existing, candidate));
    violations.extend(validate_identifier(candidate));
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Api, Substitution};

    fn inbound(ident: &str, topic: &str) -> Mapping {
        Mapping::inbound(ident, topic, Api::Measurement)
            .with_substitution(Substitution::identifier("_TOPIC_LEVEL_[1]", "source.id"))
    }

    #[test]
    fn test_valid_mapping_has_no_violations() {
        let mapping = inbound("m1", "/plant1/+/machine1");
        assert!(validate_mapping(&[], &mapping).is_empty());
    }

    #[test]
    fn test_missing_and_duplicate_identifier() {
        let mut mapping = Mapping::inbound("m1", "/a/+", Api::Event);
        assert_eq!(
            validate_identifier(&mapping),
            vec![ValidationError::IdentifierSubstitutionMissing]
        );
        mapping.substitutions.push(Substitution::identifier("a", "source.id"));
        mapping.substitutions.push(Substitution::identifier("b", "source.id"));
        assert_eq!(
            validate_identifier(&mapping),
            vec![ValidationError::MultipleIdentifierSubstitutions]
        );
    }

    #[test]
    fn test_uniqueness_uses_normalized_pattern() {
        let existing = vec![inbound("m1", "/a/+").with_id("1")];
        let candidate = inbound("m2", "//a/+").with_id("2");
        assert_eq!(
            validate_uniqueness(&existing, &candidate),
            vec![ValidationError::SubscriptionTopicNotUnique]
        );
        // an update of the same mapping is not a duplicate
        let same = inbound("m1", "/a/+").with_id("1");
        assert!(validate_uniqueness(&existing, &same).is_empty());
    }

    #[test]
    fn test_template_topic_checked_against_subscription() {
        let mapping = inbound("m1", "/device/#").with_template_topic("/device");
        assert_eq!(
            validate_topic_structure(&mapping),
            vec![ValidationError::TemplateTopicMustMatchSubscriptionTopic]
        );
    }

    #[test]
    fn test_outbound_requires_filter_and_topic() {
        let mut mapping = Mapping::outbound("o1", "", "", Api::Event);
        assert_eq!(
            validate_topic_structure(&mapping),
            vec![
                ValidationError::FilterOutboundMissing,
                ValidationError::PublishTopicMissing
            ]
        );
        mapping.filter_outbound = Some("c8y_Event".to_string());
        mapping.publish_topic = "evt/+".to_string();
        assert!(validate_topic_structure(&mapping).is_empty());
    }
}
