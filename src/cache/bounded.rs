//! Byte-budgeted index lists.
//!
//! Index lists grow by appending, so the front holds the oldest values. When a list's
//! JSON encoding reaches the budget, whole chunks are cut from the front until it fits.

use serde::Serialize;

const MIN_DECREMENT: usize = 10;

/// The result of trimming a list to a byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trimmed<T> {
    /// Contiguous suffix of the original list.
    pub kept: Vec<T>,
    /// The prefix that was cut, in original order.
    pub discarded: Vec<T>,
}

/// Byte length of the JSON encoding of `items`.
pub fn encoded_len<T: Serialize>(items: &[T]) -> Result<usize, serde_json::Error> {
    serde_json::to_vec(items).map(|encoded| encoded.len())
}

/// Keep the most recent suffix of `items` whose encoding is smaller than `budget` bytes.
///
/// The suffix shrinks by a tenth of the original length (at least ten items) per round,
/// so an oversized list may lose more than strictly necessary. The kept part is empty
/// only when no suffix tried fits.
pub fn trim_to_budget<T: Serialize>(
    mut items: Vec<T>,
    budget: usize,
) -> Result<Trimmed<T>, serde_json::Error> {
    let total = items.len();
    let decrement = (total / 10).max(MIN_DECREMENT);

    let mut keep = total;
    let mut size = encoded_len(&items)?;
    while size >= budget && keep > 0 {
        keep = keep.saturating_sub(decrement);
        size = encoded_len(&items[total - keep..])?;
    }

    let kept = items.split_off(total - keep);
    Ok(Trimmed {
        kept,
        discarded: items,
    })
}
