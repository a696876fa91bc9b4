//! Registry of live content-script contexts, keyed by tab.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use aegis_core::{ContextError, ContextKind, Origin, PageContext, TabId};

#[derive(Default)]
struct Inner {
    pages: HashMap<TabId, Arc<dyn PageContext>>,
    active: Option<TabId>,
}

/// Which tabs currently have a reachable content script.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct PageRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl PageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the content script for `tab_id`, replacing any previous one.
    pub fn register(&self, tab_id: TabId, page: Arc<dyn PageContext>) {
        tracing::debug!(tab_id, "content context registered");
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pages
            .insert(tab_id, page);
    }

    /// Forget a tab (closed or navigated away). Returns `false` if unknown.
    pub fn unregister(&self, tab_id: TabId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.active == Some(tab_id) {
            inner.active = None;
        }
        let removed = inner.pages.remove(&tab_id).is_some();
        if removed {
            tracing::debug!(tab_id, "content context unregistered");
        }
        removed
    }

    /// Mark the tab the user is looking at.
    pub fn set_active(&self, tab_id: Option<TabId>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .active = tab_id;
    }

    #[must_use]
    pub fn active(&self) -> Option<TabId> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).active
    }

    /// Find the page a request is aimed at: the explicit tab, else the
    /// sender's own tab, else the active tab.
    ///
    /// # Errors
    /// Returns [`ContextError::Unreachable`] if no such page is registered.
    pub fn resolve(
        &self,
        explicit: Option<TabId>,
        origin: &Origin,
    ) -> Result<Arc<dyn PageContext>, ContextError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let own_tab = match origin.context {
            ContextKind::Content => origin.tab_id,
            ContextKind::Background | ContextKind::Panel => None,
        };
        let tab_id = explicit
            .or(own_tab)
            .or(inner.active)
            .ok_or_else(|| ContextError::Unreachable("no target tab".to_owned()))?;

        inner
            .pages
            .get(&tab_id)
            .cloned()
            .ok_or_else(|| {
                ContextError::Unreachable(format!("tab {tab_id} has no content context"))
            })
    }
}
