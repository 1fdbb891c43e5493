//! Strategies for picking one directive out of a verdict

use crate::directive::{ProxyDirective, ProxyDirectiveList};
use crate::health::ProxyHealthRegistry;
use std::sync::Arc;

/// Chooses a single directive from an ordered candidate list. Never fails:
/// an empty or unusable list yields `DIRECT`.
pub trait ProxySelector: Send + Sync {
    fn select_proxy(&self, candidates: &ProxyDirectiveList) -> ProxyDirective;
}

/// First listed candidate wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstItemSelector;

impl ProxySelector for FirstItemSelector {
    fn select_proxy(&self, candidates: &ProxyDirectiveList) -> ProxyDirective {
        candidates
            .first()
            .cloned()
            .unwrap_or(ProxyDirective::Direct)
    }
}

/// First candidate that is `DIRECT` or not currently blacklisted.
///
/// Only reads the registry, it never dials.
#[derive(Debug, Clone)]
pub struct HealthAwareSelector {
    registry: Arc<ProxyHealthRegistry>,
}

impl HealthAwareSelector {
    pub fn new(registry: Arc<ProxyHealthRegistry>) -> Self {
        Self { registry }
    }
}

impl ProxySelector for HealthAwareSelector {
    fn select_proxy(&self, candidates: &ProxyDirectiveList) -> ProxyDirective {
        candidates
            .iter()
            .find(|candidate| match candidate.address() {
                Some(address) => !self.registry.is_blacklisted(&address),
                None => true,
            })
            .cloned()
            .unwrap_or(ProxyDirective::Direct)
    }
}
