//! Ordered, regex-keyed enrichers applied to alerts on first sight.

use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::models::Alert;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransformError(pub String);

/// An enrichment step. `register()` is a regex matched against alert
/// names; matching transforms run in ascending `priority()` order.
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn register(&self) -> &str;
    fn apply(&self, alert: &mut Alert) -> Result<(), TransformError>;
}

struct Entry {
    regex: Regex,
    transform: Arc<dyn Transform>,
}

/// Registry assembled at startup; immutable afterwards.
#[derive(Default)]
pub struct TransformRegistry {
    entries: Vec<Entry>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        TransformRegistry::default()
    }

    /// Register a transform; fails if its name pattern is not a valid
    /// regex.
    pub fn add(&mut self, transform: Arc<dyn Transform>) -> Result<(), regex::Error> {
        let regex = Regex::new(transform.register())?;
        self.entries.push(Entry { regex, transform });
        Ok(())
    }

    /// Transforms applicable to `name`, ordered by ascending priority.
    /// The sort is stable, so equal priorities keep registration order.
    pub fn matching(&self, name: &str) -> Vec<Arc<dyn Transform>> {
        let mut matched: Vec<Arc<dyn Transform>> = self
            .entries
            .iter()
            .filter(|e| e.regex.is_match(name))
            .map(|e| e.transform.clone())
            .collect();
        matched.sort_by_key(|t| t.priority());
        matched
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Tagger {
        name: &'static str,
        priority: i32,
        pattern: &'static str,
    }

    impl Transform for Tagger {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn register(&self) -> &str {
            self.pattern
        }

        fn apply(&self, alert: &mut Alert) -> Result<(), TransformError> {
            alert
                .labels
                .insert(self.name.to_string(), serde_json::json!(true));
            Ok(())
        }
    }

    #[test]
    fn matching_sorts_by_priority() {
        let mut registry = TransformRegistry::new();
        registry
            .add(Arc::new(Tagger { name: "late", priority: 20, pattern: "^Neteng" }))
            .unwrap();
        registry
            .add(Arc::new(Tagger { name: "early", priority: 1, pattern: "BGP" }))
            .unwrap();
        registry
            .add(Arc::new(Tagger { name: "other", priority: 5, pattern: "^Facilities" }))
            .unwrap();

        let matched = registry.matching("Neteng BGP Down");
        let names: Vec<&str> = matched.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let mut registry = TransformRegistry::new();
        let err = registry.add(Arc::new(Tagger { name: "bad", priority: 0, pattern: "(" }));
        assert!(err.is_err());
        assert!(registry.is_empty());
    }
}
