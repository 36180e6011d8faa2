//! Event type to cache scope classification.
//!
//! The classifier walks an ordered rule table and returns the scopes of the
//! FIRST rule that matches the trimmed event type. Rules are not ranked by
//! specificity: an exact rule placed after a prefix rule that also matches
//! is never reached. Event types that match no rule invalidate every scope.

use crate::{CacheScope, ScopeSet};

/// How a rule matches an event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatcher {
    /// The trimmed event type equals the string.
    Exact(&'static str),
    /// The trimmed event type starts with the string.
    Prefix(&'static str),
}

impl RuleMatcher {
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            RuleMatcher::Exact(expected) => event_type == *expected,
            RuleMatcher::Prefix(prefix) => event_type.starts_with(prefix),
        }
    }
}

/// One row of the classification table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRule {
    pub matcher: RuleMatcher,
    pub scopes: &'static [CacheScope],
}

impl ScopeRule {
    pub const fn exact(event_type: &'static str, scopes: &'static [CacheScope]) -> Self {
        Self {
            matcher: RuleMatcher::Exact(event_type),
            scopes,
        }
    }

    pub const fn prefix(prefix: &'static str, scopes: &'static [CacheScope]) -> Self {
        Self {
            matcher: RuleMatcher::Prefix(prefix),
            scopes,
        }
    }
}

/// Canonical rule table, evaluated top to bottom.
pub const CAMPAIGN_SCOPE_RULES: &[ScopeRule] = &[
    ScopeRule::prefix("campaign.", &[CacheScope::Summary]),
    ScopeRule::prefix(
        "participant.",
        &[CacheScope::Participants, CacheScope::Summary],
    ),
    ScopeRule::exact(
        "seat.reassigned",
        &[CacheScope::Participants, CacheScope::Summary],
    ),
    ScopeRule::prefix("session.", &[CacheScope::Sessions]),
    ScopeRule::prefix(
        "character.",
        &[CacheScope::Characters, CacheScope::Summary],
    ),
    ScopeRule::prefix("invite.", &[CacheScope::Invites]),
];

/// First-match classifier over an ordered rule table.
#[derive(Debug, Clone)]
pub struct ScopeClassifier {
    rules: &'static [ScopeRule],
}

impl Default for ScopeClassifier {
    fn default() -> Self {
        Self {
            rules: CAMPAIGN_SCOPE_RULES,
        }
    }
}

impl ScopeClassifier {
    /// Build a classifier over a custom table. Order is significant.
    pub fn with_rules(rules: &'static [ScopeRule]) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &'static [ScopeRule] {
        self.rules
    }

    /// Scopes invalidated by one event type. Never empty.
    pub fn classify(&self, event_type: &str) -> ScopeSet {
        let event_type = event_type.trim();
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(event_type))
            .map(|rule| rule.scopes.iter().copied().collect())
            .unwrap_or_else(ScopeSet::all)
    }

    /// Union of the scopes invalidated by each event type.
    pub fn classify_all<'a, I>(&self, event_types: I) -> ScopeSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut scopes = ScopeSet::new();
        for event_type in event_types {
            scopes.union_with(&self.classify(event_type));
            if scopes.is_all() {
                break;
            }
        }
        scopes
    }
}

/// Classify one event type with the canonical rule table.
pub fn classify_event(event_type: &str) -> ScopeSet {
    ScopeClassifier::default().classify(event_type)
}

/// Classify a batch of event types with the canonical rule table.
pub fn classify_events<'a, I>(event_types: I) -> ScopeSet
where
    I: IntoIterator<Item = &'a str>,
{
    ScopeClassifier::default().classify_all(event_types)
}
