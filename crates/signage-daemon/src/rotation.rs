//! Rotation planner: decides which content item a channel transmits next.
//!
//! The cursor remembers a fingerprint of the sequence it was built for.  When
//! the web layer edits a channel's content list while it is live, the next
//! call sees a different fingerprint and starts over from the first item.
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use signage_proto::protocol::{ContentItem, RepeatMode};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Item(ContentItem),
    /// Play-once sequence exhausted (or nothing left to play).
    EndOfSequence,
}

struct Cursor {
    fingerprint: u64,
    /// Content indices in transmission order for the current cycle.
    order: Vec<usize>,
    /// Position in `order` of the item the next call returns.
    index: usize,
    cycle: u64,
    rng: StdRng,
    last: Option<usize>,
}

impl Cursor {
    fn new(fingerprint: u64, len: usize, repeat: RepeatMode, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..len).collect();
        if repeat == RepeatMode::Shuffle {
            order.shuffle(&mut rng);
        }
        Self {
            fingerprint,
            order,
            index: 0,
            cycle: 0,
            rng,
            last: None,
        }
    }

    fn reshuffle(&mut self, contents: &[ContentItem]) {
        self.order.shuffle(&mut self.rng);
        let len = self.order.len();
        let Some(last) = self.last else { return };
        if len < 2 || contents[self.order[0]].source != contents[last].source {
            return;
        }
        // Swap the repeat away from the head of the new cycle.
        let start = self.rng.gen_range(1..len);
        for offset in 0..len - 1 {
            let j = 1 + (start - 1 + offset) % (len - 1);
            if contents[self.order[j]].source != contents[last].source {
                self.order.swap(0, j);
                return;
            }
        }
    }
}

#[derive(Default)]
pub struct RotationPlanner {
    cursor: Option<Cursor>,
    seed: Option<u64>,
}

impl RotationPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Planner whose shuffle permutations are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            cursor: None,
            seed: Some(seed),
        }
    }

    pub fn next(&mut self, contents: &[ContentItem], repeat: RepeatMode) -> Step {
        if contents.is_empty() {
            self.cursor = None;
            return Step::EndOfSequence;
        }

        let fingerprint = fingerprint(contents, repeat);
        let stale = self
            .cursor
            .as_ref()
            .map_or(true, |c| c.fingerprint != fingerprint);
        if stale {
            if self.cursor.is_some() {
                debug!("rotation: content sequence changed, restarting from first item");
            }
            let seed = self.seed.unwrap_or_else(rand::random);
            self.cursor = Some(Cursor::new(fingerprint, contents.len(), repeat, seed));
        }

        let Some(cursor) = self.cursor.as_mut() else {
            return Step::EndOfSequence;
        };

        if cursor.index >= cursor.order.len() {
            match repeat {
                RepeatMode::PlayOnce => return Step::EndOfSequence,
                RepeatMode::Loop => {}
                RepeatMode::Shuffle => cursor.reshuffle(contents),
            }
            cursor.index = 0;
            cursor.cycle += 1;
        }

        let idx = cursor.order[cursor.index];
        cursor.index += 1;
        cursor.last = Some(idx);
        Step::Item(contents[idx].clone())
    }

    /// Position within the current cycle of the item the next call returns.
    /// Wraps to 0 once a full cycle has been handed out.
    pub fn cursor_index(&self) -> usize {
        match &self.cursor {
            Some(c) if c.index < c.order.len() => c.index,
            _ => 0,
        }
    }

    /// Content index of the item most recently returned.
    pub fn current(&self) -> Option<usize> {
        self.cursor.as_ref().and_then(|c| c.last)
    }

    /// Number of completed wrap-arounds.
    pub fn cycle(&self) -> u64 {
        self.cursor.as_ref().map_or(0, |c| c.cycle)
    }
}

fn fingerprint(contents: &[ContentItem], repeat: RepeatMode) -> u64 {
    let mut hasher = DefaultHasher::new();
    contents.len().hash(&mut hasher);
    for item in contents {
        item.source.hash(&mut hasher);
    }
    (repeat as u8).hash(&mut hasher);
    hasher.finish()
}
