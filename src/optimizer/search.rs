//! One-dimensional search primitives used by the mutation algorithms.

use serde::{Deserialize, Serialize};

/// How many evenly spaced probes [`BinSearcher`] makes before bisecting.
pub const MAPPING_ITERATIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ValueEfficacyPair {
    pub value: f64,
    pub efficacy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CliffState {
    #[default]
    NotCliffing,
    InProgress,
    Finished,
}

/// Locates a sharp efficacy drop between a good "edge" value and a bad
/// "ground" value by midpoint probing.
///
/// The efficacy is expected to rise towards the edge and fall off a cliff
/// somewhere between the edge and the ground; every probe halves the
/// interval until it is narrower than epsilon.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CliffFinder {
    pub state: CliffState,
    pub edge_efficacy: f64,
    pub edge: f64,
    pub ground_efficacy: f64,
    pub ground: f64,
    pub epsilon: f64,
}

impl CliffFinder {
    /// Starts a search between two probed points.
    ///
    /// The higher-scoring point always becomes the edge, whichever way the
    /// caller passed them.
    pub fn init(
        &mut self,
        edge_efficacy: f64,
        edge: f64,
        ground_efficacy: f64,
        ground: f64,
        epsilon: f64,
    ) {
        if ground_efficacy > edge_efficacy {
            self.edge = ground;
            self.edge_efficacy = ground_efficacy;
            self.ground = edge;
            self.ground_efficacy = edge_efficacy;
        } else {
            self.edge = edge;
            self.edge_efficacy = edge_efficacy;
            self.ground = ground;
            self.ground_efficacy = ground_efficacy;
        }
        self.epsilon = epsilon;
        self.state = if (self.edge - self.ground).abs() <= epsilon {
            CliffState::Finished
        } else {
            CliffState::InProgress
        };
    }

    /// Seeds the search from a table of probed values.
    ///
    /// The best probe becomes the edge and the nearest strictly worse probe
    /// (scanning forward first, then backward) becomes the ground. A flat
    /// table has no cliff to find and finishes immediately.
    pub fn init_from_pairs(&mut self, pairs: &[ValueEfficacyPair], epsilon: f64) {
        self.reset();

        if pairs.is_empty() {
            return;
        }

        // First maximum wins ties so the search stays on the near side.
        let mut best = 0;
        for (i, pair) in pairs.iter().enumerate() {
            if pair.efficacy > pairs[best].efficacy {
                best = i;
            }
        }

        let worse = pairs[best + 1..]
            .iter()
            .find(|pair| pair.efficacy < pairs[best].efficacy)
            .or_else(|| {
                pairs[..best]
                    .iter()
                    .rev()
                    .find(|pair| pair.efficacy < pairs[best].efficacy)
            });

        match worse {
            Some(ground) => self.init(
                pairs[best].efficacy,
                pairs[best].value,
                ground.efficacy,
                ground.value,
                epsilon,
            ),
            None => self.state = CliffState::Finished,
        }
    }

    /// The next value to probe.
    pub fn value(&self) -> f64 {
        (self.edge + self.ground) / 2.
    }

    pub fn report(&mut self, result: f64) {
        if self.state != CliffState::InProgress {
            return;
        }

        let midpoint = self.value();
        if result > self.edge_efficacy + self.epsilon {
            self.edge = midpoint;
            self.edge_efficacy = result;
        } else {
            self.ground = midpoint;
            self.ground_efficacy = result;
        }

        if (self.edge - self.ground).abs() <= self.epsilon {
            self.state = CliffState::Finished;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BinarySearchState {
    #[default]
    NoSearch,
    /// Probing evenly spaced values to map out the search range.
    MappingSpace,
    /// Refining the cliff found in the mapping table.
    BinarySearch,
    Finished,
}

/// Three-phase optimizer over a one-dimensional range.
///
/// Probes [`MAPPING_ITERATIONS`] values linearly spaced through
/// `(original, max]`, then seeds a [`CliffFinder`] from the results and
/// bisects until its epsilon is met. Drive it by alternating
/// [`BinSearcher::value`] and [`BinSearcher::report`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BinSearcher {
    pub cliffer: CliffFinder,
    pub state: BinarySearchState,
    pub original_value: f64,
    pub original_efficacy: f64,
    pub range_max: f64,
    pub epsilon: f64,
    pub mapping: Vec<ValueEfficacyPair>,
    pub mapping_iteration: u32,
    pub initialized: bool,
}

impl BinSearcher {
    pub fn init(&mut self, original: f64, original_efficacy: f64, max: f64, epsilon: f64) {
        self.reset();
        self.original_value = original;
        self.original_efficacy = original_efficacy;
        self.range_max = max;
        self.epsilon = epsilon;
        self.state = BinarySearchState::MappingSpace;
        self.initialized = true;
    }

    /// The next value to try.
    pub fn value(&self) -> f64 {
        match self.state {
            BinarySearchState::MappingSpace => {
                let step = (self.range_max - self.original_value) / MAPPING_ITERATIONS as f64;
                self.original_value + step * (self.mapping_iteration + 1) as f64
            }
            BinarySearchState::BinarySearch => self.cliffer.value(),
            _ => self.original_value,
        }
    }

    /// Reports the efficacy of the last proposed value, higher is better.
    pub fn report(&mut self, result: f64) {
        match self.state {
            BinarySearchState::MappingSpace => {
                self.mapping.push(ValueEfficacyPair {
                    value: self.value(),
                    efficacy: result,
                });
                self.mapping_iteration += 1;

                if self.mapping_iteration == MAPPING_ITERATIONS {
                    self.cliffer.init_from_pairs(&self.mapping, self.epsilon);
                    self.state = if self.cliffer.state == CliffState::Finished {
                        BinarySearchState::Finished
                    } else {
                        BinarySearchState::BinarySearch
                    };
                }
            }
            BinarySearchState::BinarySearch => {
                self.cliffer.report(result);
                if self.cliffer.state == CliffState::Finished {
                    self.state = BinarySearchState::Finished;
                }
            }
            _ => {}
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(
            self.state,
            BinarySearchState::MappingSpace | BinarySearchState::BinarySearch
        )
    }

    pub fn is_finished(&self) -> bool {
        self.state == BinarySearchState::Finished
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Momentum-style step expander: the world's only stone that rolls uphill.
///
/// While each reported efficacy strictly beats the previous one, the step
/// doubles and the value keeps moving in the same direction; the first
/// regression, or running into the `max` bound, stops it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RollingStone {
    pub prev_efficacy: f64,
    pub current_value: f64,
    pub prev_delta: f64,
    pub max: f64,
}

/// Step growth factor per accepted move.
const MULTIPLICATION_FACTOR: f64 = 2.;

impl RollingStone {
    pub fn init(&mut self, efficacy: f64, start_value: f64, start_delta: f64, max_value: f64) {
        self.prev_efficacy = efficacy;
        self.current_value = start_value;
        self.prev_delta = start_delta;
        self.max = max_value;
    }

    /// Whether the stone should keep rolling after seeing `new_efficacy`.
    ///
    /// `max` bounds the absolute value of the position; a negative bound is
    /// treated as its absolute value.
    pub fn should_continue(&self, new_efficacy: f64) -> bool {
        new_efficacy > self.prev_efficacy && self.current_value.abs() < self.max.abs()
    }

    /// Accepts `new_efficacy`, doubles the step and advances, clamped into
    /// `[-|max|, |max|]`.
    pub fn next_value(&mut self, new_efficacy: f64) {
        self.prev_efficacy = new_efficacy;
        self.prev_delta *= MULTIPLICATION_FACTOR;
        let bound = self.max.abs();
        self.current_value = (self.current_value + self.prev_delta).clamp(-bound, bound);
    }
}
