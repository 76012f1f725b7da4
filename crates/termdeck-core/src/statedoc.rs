//! Parsing and diffing of the external state document.
//!
//! The document is a JSON file owned by another process; this system only
//! reads it. Shape (extra fields ignored):
//!
//! ```json
//! { "current_session": { "current_agent": { "pane_id": "%3" } },
//!   "panes": ["%1", "%2"] }
//! ```

use std::collections::BTreeSet;

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub current_session: Option<CurrentSession>,
    #[serde(default)]
    pub panes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrentSession {
    #[serde(default)]
    pub current_agent: Option<CurrentAgent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CurrentAgent {
    #[serde(default)]
    pub pane_id: Option<String>,
}

impl StateDocument {
    /// The set of active pane ids: the distinguished current-agent pane
    /// plus every entry of `panes[]`.
    pub fn active_panes(&self) -> BTreeSet<String> {
        let mut set: BTreeSet<String> = self
            .panes
            .iter()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        if let Some(pane_id) = self
            .current_session
            .as_ref()
            .and_then(|s| s.current_agent.as_ref())
            .and_then(|a| a.pane_id.clone())
        {
            if !pane_id.is_empty() {
                set.insert(pane_id);
            }
        }
        set
    }
}

pub fn parse_state_document(text: &str) -> Result<StateDocument, serde_json::Error> {
    serde_json::from_str(text)
}

/// `(added, removed)` between two observed pane sets, each sorted.
pub fn diff_panes(
    prev: &BTreeSet<String>,
    next: &BTreeSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = next.difference(prev).cloned().collect();
    let removed = prev.difference(next).cloned().collect();
    (added, removed)
}
