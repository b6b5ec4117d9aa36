//! Domain Context passed to plugins on every generation call
//!
//! The orchestrator snapshots a session's shared context into a
//! `DomainContext` under a brief read lock, then hands the snapshot to the
//! plugin with no session lock held.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-call context for one domain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainContext {
    /// Domain the context was built for (e.g., "kyc", "ubo")
    pub domain_name: String,

    /// Orchestration session the call belongs to
    pub session_id: String,

    /// Domain-local sub-session identifier
    pub domain_session_id: Option<String>,

    /// Current sub-session state as reported by the orchestrator
    pub current_state: Option<String>,

    /// Shared and domain-specific business values
    pub business_context: BTreeMap<String, serde_json::Value>,
}

impl DomainContext {
    pub fn new(domain_name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            domain_name: domain_name.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_domain_session(mut self, id: impl Into<String>, state: impl Into<String>) -> Self {
        self.domain_session_id = Some(id.into());
        self.current_state = Some(state.into());
        self
    }

    /// Set business context data
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.business_context.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.business_context.insert(key.into(), value);
    }

    /// Get business context value by key
    pub fn get_context<T>(&self, key: &str) -> Option<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.business_context
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.business_context.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.business_context.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.business_context.len()
    }

    pub fn is_empty(&self) -> bool {
        self.business_context.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_context_lookup() {
        let ctx = DomainContext::new("kyc", "session-1")
            .with_domain_session("kyc-1", "CREATED")
            .with_context("products", json!(["CUSTODY", "TRADING"]))
            .with_context("jurisdiction", json!("US"));

        let products: Vec<String> = ctx.get_context("products").unwrap();
        assert_eq!(products, vec!["CUSTODY", "TRADING"]);
        assert_eq!(ctx.get_str("jurisdiction"), Some("US"));
        assert_eq!(ctx.current_state.as_deref(), Some("CREATED"));
        assert!(ctx.get_context::<u32>("jurisdiction").is_none());
    }
}
