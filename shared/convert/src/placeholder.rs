use std::collections::BTreeMap;
use std::fmt;

/// A symbolic token that can appear inside a key template, standing for the
/// index of a repeated structure (a transformer block, an MoE expert).
///
/// The set is closed: supporting a new kind of repeated structure means adding
/// a variant here. Placeholders are substituted by plain substring replacement
/// of their bracketed token, and double as ordered map keys for bound/value
/// lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemplatePlaceholder {
    Layer,
    Expert,
}

impl TemplatePlaceholder {
    /// The bracketed token this placeholder occupies inside a key template.
    pub fn token(&self) -> &'static str {
        match self {
            TemplatePlaceholder::Layer => "[layer]",
            TemplatePlaceholder::Expert => "[expert]",
        }
    }
}

impl fmt::Display for TemplatePlaceholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Exclusive upper bound for each placeholder in a specific model instance,
/// e.g. the layer count. Supplied per conversion call; templates never carry
/// bounds, so one template set serves a whole model family.
pub type PlaceholderBounds = BTreeMap<TemplatePlaceholder, usize>;

/// A partial assignment of placeholder values. `None` is the
/// expand-over-all-values sentinel: it requests per-placeholder key expansion
/// rather than substitution of one concrete index.
pub type PlaceholderValues = BTreeMap<TemplatePlaceholder, Option<usize>>;

/// Odometer over every combination of placeholder assignments: each
/// placeholder takes every value in `0..bound` followed by the unset
/// sentinel, so the total number of combinations is the product of
/// `bound + 1` over all placeholders in the bounds. With no placeholders it
/// yields exactly one empty assignment.
pub(crate) struct PlaceholderAssignments {
    placeholders: Vec<(TemplatePlaceholder, usize)>,
    counters: Vec<usize>,
    done: bool,
}

impl PlaceholderAssignments {
    pub(crate) fn new(bounds: &PlaceholderBounds) -> Self {
        let placeholders: Vec<_> = bounds.iter().map(|(p, b)| (*p, *b)).collect();
        let counters = vec![0; placeholders.len()];
        Self {
            placeholders,
            counters,
            done: false,
        }
    }
}

impl Iterator for PlaceholderAssignments {
    type Item = PlaceholderValues;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let assignment: PlaceholderValues = self
            .placeholders
            .iter()
            .zip(&self.counters)
            .map(|(&(placeholder, bound), &counter)| {
                // counter == bound encodes the unset sentinel
                let value = if counter < bound { Some(counter) } else { None };
                (placeholder, value)
            })
            .collect();

        // Advance the odometer, least-significant position last so the
        // leftmost placeholder varies slowest.
        self.done = true;
        for (counter, &(_, bound)) in self.counters.iter_mut().zip(&self.placeholders).rev() {
            if *counter < bound {
                *counter += 1;
                self.done = false;
                break;
            }
            *counter = 0;
        }

        Some(assignment)
    }
}
