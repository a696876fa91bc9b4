//! Execution-context addressing.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::traits::{ContextError, PageContext};

/// Browser tab identifier.
pub type TabId = i64;

/// Which isolated execution environment a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// Long-lived coordinator.
    Background,
    /// Script injected into a page.
    Content,
    /// User-facing panel.
    Panel,
}

/// Sender of a message.
///
/// Content contexts carry the tab they live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub context: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
}

impl Origin {
    #[must_use]
    pub const fn background() -> Self {
        Self {
            context: ContextKind::Background,
            tab_id: None,
        }
    }

    #[must_use]
    pub const fn panel() -> Self {
        Self {
            context: ContextKind::Panel,
            tab_id: None,
        }
    }

    #[must_use]
    pub const fn content(tab_id: TabId) -> Self {
        Self {
            context: ContextKind::Content,
            tab_id: Some(tab_id),
        }
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::panel()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.context, self.tab_id) {
            (ContextKind::Background, _) => f.write_str("background"),
            (ContextKind::Panel, _) => f.write_str("panel"),
            (ContextKind::Content, Some(tab)) => write!(f, "content(tab {tab})"),
            (ContextKind::Content, None) => f.write_str("content"),
        }
    }
}

/// A page captured at a point in time.
///
/// Stands in for a live content script when the page text is already known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub text: String,
    #[serde(default)]
    pub links: Vec<String>,
}

impl PageSnapshot {
    #[must_use]
    pub fn new(text: impl Into<String>, links: Vec<String>) -> Self {
        Self {
            text: text.into(),
            links,
        }
    }
}

#[async_trait]
impl PageContext for PageSnapshot {
    async fn extract_text(&self) -> Result<String, ContextError> {
        Ok(self.text.clone())
    }

    async fn extract_links(&self) -> Result<Vec<String>, ContextError> {
        Ok(self.links.clone())
    }
}
