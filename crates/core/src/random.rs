//! Seedable random values for test procedures.
//!
//! A [`Random`] is created once per run (seeded from configuration when a
//! reproducible run is wanted) and handed to every step through its
//! harness. Clones share one generator.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};

const WORDS: [&str; 10] = [
    "apple",
    "orange",
    "banana",
    "pear",
    "grape",
    "pineapple",
    "mango",
    "strawberry",
    "raspberry",
    "blueberry",
];

/// Words per [`Random::random_string`].
pub const WORDS_PER_STRING: usize = 6;

#[derive(Clone)]
pub struct Random {
    rng: Arc<Mutex<StdRng>>,
}

impl Random {
    /// Deterministic generator: the same seed yields the same sequence.
    pub fn from_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Integer in `[min, max)`. Panics if the range is empty.
    pub fn random_int(&self, min: i64, max: i64) -> i64 {
        self.rng().random_range(min..max)
    }

    /// `count` distinct integers in `[min, max)`.
    ///
    /// Panics if `count` exceeds the size of the range.
    pub fn random_ints(&self, min: i64, max: i64, count: usize) -> Vec<i64> {
        let span = usize::try_from(max.saturating_sub(min)).unwrap_or(0);
        assert!(
            count <= span,
            "can't generate more unique random integers than the range of possible values"
        );

        index::sample(&mut *self.rng(), span, count)
            .into_iter()
            .map(|offset| min + offset as i64)
            .collect()
    }

    /// Float in `[min, max)`. Panics if `max < min`.
    pub fn random_float64(&self, min: f64, max: f64) -> f64 {
        assert!(max >= min, "max boundary is less than min boundary");
        let unit: f64 = self.rng().random();
        min + (max - min) * unit
    }

    pub fn random_float64s(&self, min: f64, max: f64, count: usize) -> Vec<f64> {
        (0..count).map(|_| self.random_float64(min, max)).collect()
    }

    pub fn random_word(&self) -> String {
        let index = self.rng().random_range(0..WORDS.len());
        WORDS[index].to_string()
    }

    pub fn random_words(&self, count: usize) -> Vec<String> {
        self.random_elements(&WORDS, count)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// [`WORDS_PER_STRING`] random words joined by spaces.
    pub fn random_string(&self) -> String {
        self.random_words(WORDS_PER_STRING).join(" ")
    }

    pub fn random_strings(&self, count: usize) -> Vec<String> {
        (0..count).map(|_| self.random_string()).collect()
    }

    /// `count` elements picked from `items` without reusing a position.
    ///
    /// When `count` exceeds `items.len()` the source is repeated until it is
    /// long enough, so each element appears at most `ceil(count / len)`
    /// times.
    pub fn random_elements<T: Clone>(&self, items: &[T], count: usize) -> Vec<T> {
        if items.is_empty() {
            return Vec::new();
        }

        let mut pool = items.to_vec();
        while pool.len() < count {
            pool.extend_from_slice(items);
        }

        index::sample(&mut *self.rng(), pool.len(), count)
            .into_iter()
            .map(|i| pool[i].clone())
            .collect()
    }

    pub fn random_element<T: Clone>(&self, items: &[T]) -> Option<T> {
        self.random_elements(items, 1).into_iter().next()
    }

    /// A shuffled copy of `items`.
    pub fn shuffle<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let mut shuffled = items.to_vec();
        shuffled.shuffle(&mut *self.rng());
        shuffled
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::from_entropy()
    }
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Random").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
