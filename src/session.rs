//! Recording sessions.
//!
//! Every time a datastore is opened for writing a new session id is derived
//! from the history stored in the manifest. The session is only appended to
//! that history if at least one record was written before close.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session history kept under `manifest_metadata.sessions`. Field order is
/// the order the keys are written in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHistory {
    #[serde(default)]
    pub all_full_ids: Vec<String>,
    #[serde(default)]
    pub last_id: u64,
    #[serde(default)]
    pub last_full_id: String,
}

impl SessionHistory {
    /// Append `session` and make it the latest one.
    pub fn record(&mut self, session: &SessionId) {
        self.all_full_ids.push(session.full_id.clone());
        self.last_id = session.id;
        self.last_full_id.clone_from(&session.full_id);
    }

    /// A history with no recorded session, e.g. an empty `sessions` object.
    pub fn is_empty(&self) -> bool {
        self.all_full_ids.is_empty() && self.last_full_id.is_empty()
    }
}

/// `(numeric id, "yy-mm-dd_<id>")` of the current writing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub id: u64,
    pub full_id: String,
}

impl SessionId {
    /// Next session after `history`, dated with today's local date.
    pub fn next(history: Option<&SessionHistory>) -> Self {
        Self::next_on(history, Local::now().date_naive())
    }

    /// Next session after `history`, dated `date`.
    pub fn next_on(history: Option<&SessionHistory>, date: NaiveDate) -> Self {
        let id = history
            .filter(|history| !history.is_empty())
            .map_or(0, |history| history.last_id.saturating_add(1));
        Self {
            id,
            full_id: format!("{}_{id}", date.format("%y-%m-%d")),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_id)
    }
}
