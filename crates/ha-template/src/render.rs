//! The render contract used by trackers
//!
//! A renderer evaluates a template and reports, alongside the result, every
//! piece of state the evaluation read. Trackers subscribe to exactly that
//! set and re-render when any of it changes.

use std::collections::BTreeSet;

use crate::error::TemplateError;

/// Variables passed to a render, in insertion order
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Outcome of one render plus the state it touched
#[derive(Debug, Clone, PartialEq)]
pub struct RenderInfo {
    pub result: Result<String, TemplateError>,
    /// Entity ids dereferenced one by one
    pub entities: BTreeSet<String>,
    /// Domains iterated as a whole
    pub domains: BTreeSet<String>,
    /// Whether the whole state collection was iterated
    pub all_states: bool,
}

impl RenderInfo {
    /// Combine the dependencies of `other` into this one, keeping this result
    pub fn merge_dependencies(&mut self, other: &RenderInfo) {
        self.entities.extend(other.entities.iter().cloned());
        self.domains.extend(other.domains.iter().cloned());
        self.all_states |= other.all_states;
    }
}

/// Something that can render a template and record its state accesses
pub trait TemplateRenderer: Send + Sync {
    /// Render `template` with `variables`; never panics, errors are in the result
    fn render(&self, template: &str, variables: &Variables) -> RenderInfo;

    /// Check that `template` compiles without rendering it
    fn validate(&self, template: &str) -> Result<(), TemplateError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(entities: &[&str], domains: &[&str], all_states: bool) -> RenderInfo {
        RenderInfo {
            result: Ok(String::new()),
            entities: entities.iter().map(|s| s.to_string()).collect(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            all_states,
        }
    }

    #[test]
    fn test_merge_keeps_result() {
        let mut failed = RenderInfo {
            result: Err(TemplateError::Render("boom".into())),
            ..info(&[], &[], false)
        };
        failed.merge_dependencies(&info(&["switch.a"], &["lock"], false));

        assert!(failed.result.is_err());
        assert_eq!(failed.entities, BTreeSet::from(["switch.a".to_string()]));
        assert_eq!(failed.domains, BTreeSet::from(["lock".to_string()]));
        assert!(!failed.all_states);
    }
}
