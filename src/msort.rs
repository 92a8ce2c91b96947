//! Mutation Batch De-duplication
//!
//! Utilities for compacting batches of mutations before they are staged.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::Mutation;

/// Last-one-wins removal of mutations with duplicate keys.
///
/// If two mutations share a key, the one with the later HLC time survives.
/// Among mutations with identical keys and times, exactly one is kept,
/// chosen arbitrarily. Relative order of surviving keys follows their last
/// occurrence in the input.
///
/// A mutation with an entirely empty key is an upstream coding error and is
/// rejected; an empty JSON array (`[]`) is acceptable.
pub fn unique_by_key(mut x: Vec<Mutation>) -> Result<Vec<Mutation>> {
    // Index into the slice currently holding data for each key.
    let mut seen_idx: HashMap<Vec<u8>, usize> = HashMap::with_capacity(x.len());

    // Iterate backwards, compacting unique keys toward the rear.
    let mut dest = x.len();
    for src in (0..x.len()).rev() {
        if x[src].key.is_empty() {
            return Err(Error::EmptyKey { table: "<batch>".into() });
        }
        let key = x[src].key.clone();
        match seen_idx.get(&key).copied() {
            Some(cur_idx) => {
                if x[src].time > x[cur_idx].time {
                    x[cur_idx] = x[src].clone();
                }
            }
            None => {
                dest -= 1;
                seen_idx.insert(key, dest);
                x.swap(dest, src);
            }
        }
    }

    x.drain(..dest);
    Ok(x)
}
