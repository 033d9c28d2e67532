//! Idea selection rules.
//!
//! Pure functions over index sets: no I/O, no shared state. The session
//! snapshot owns the selection; the guard only decides what the next one is.

use std::collections::BTreeSet;

use crate::error::SelectionError;

/// Indices of the ideas a user picked.
pub type Selection = BTreeSet<usize>;

/// Exactly this many ideas go to deep research.
pub const REQUIRED_SELECTION: usize = 3;

/// Enforces selection cardinality and subset consistency.
pub struct SelectionGuard;

impl SelectionGuard {
    /// Flip `index` in `current`.
    ///
    /// Removing always succeeds. Adding a fourth index is rejected and the
    /// caller keeps `current`.
    pub fn toggle(current: &Selection, index: usize) -> Result<Selection, SelectionError> {
        let mut next = current.clone();
        if next.remove(&index) {
            return Ok(next);
        }
        if next.len() >= REQUIRED_SELECTION {
            return Err(SelectionError::LimitExceeded {
                limit: REQUIRED_SELECTION,
            });
        }
        next.insert(index);
        Ok(next)
    }

    /// Accept only exactly three indices, all present in `available`.
    pub fn validate_for_submission(
        selection: &Selection,
        available: &BTreeSet<usize>,
    ) -> Result<(), SelectionError> {
        if selection.len() != REQUIRED_SELECTION {
            return Err(SelectionError::InvalidSelection {
                reason: format!(
                    "exactly {REQUIRED_SELECTION} ideas must be selected, got {}",
                    selection.len()
                ),
            });
        }
        let unknown: Vec<String> = selection
            .difference(available)
            .map(|i| i.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(SelectionError::InvalidSelection {
                reason: format!(
                    "idea index {} not in the current quick read ({} ideas)",
                    unknown.join(", "),
                    available.len()
                ),
            });
        }
        Ok(())
    }
}
