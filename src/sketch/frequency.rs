use std::hash::{BuildHasher, Hash};

use ahash::RandomState;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Row seeds: a mixture of constants from FNV-1a, CityHash and Murmur3.
const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

/// Clears the top bit of every nibble so a one-bit right shift cannot carry
/// into the neighbouring counter.
const RESET_MASK: u64 = 0x7777_7777_7777_7777;

/// Low bit of every nibble; used to count odd counters during aging.
const ONE_MASK: u64 = 0x1111_1111_1111_1111;

const SPREAD_MULTIPLIER: u32 = 0x045d_9f3b;

/// Saturation value of a 4-bit counter.
pub const MAX_FREQUENCY: u8 = 15;

/// Upper bound on the requested slot count (`i32::MAX >> 1`), applied before
/// rounding up to a power of two.
const MAX_SLOTS: i64 = (i32::MAX >> 1) as i64;

/// Counter matrix of a sized sketch.
struct Table {
    /// 16 four-bit counters per word; length is a power of two.
    words: Box<[u64]>,
    /// `words.len() - 1`.
    mask: usize,
    /// Successful increments between two aging passes.
    sample_size: u32,
    /// Successful increments since the last aging pass (approximate).
    size: u32,
}

/// A probabilistic multiset estimating how often a key was seen recently.
///
/// Each `u64` in the table packs **16 saturating 4-bit counters**, so no
/// estimate ever exceeds [`MAX_FREQUENCY`].  Four rows are folded into the
/// same table: a key picks one 2-bit `start` offset and, for row `i`, reads
/// lane `start + i` of the word chosen by that row's seeded hash.  The
/// estimate is the minimum of the four counters (Count-Min).
///
/// ## Aging
///
/// After `sample_size` successful increments (ten per slot) every counter is
/// halved in one sequential pass over the table.  The running `size` is
/// halved too, minus a quarter of the odd counters whose remainder the
/// integer halving dropped.  Recent popularity therefore outweighs history,
/// at an amortized O(1) cost per increment.
///
/// ## Lifecycle
///
/// The sketch starts unsized: `frequency` answers 0 and `increment` is a
/// no-op until [`ensure_capacity`](Self::ensure_capacity) allocates the
/// table.  Growing the table forgets every previous count; it never shrinks.
///
/// ## References
/// - Cormode & Muthukrishnan (2005). *An Improved Data Stream Summary: The
///   Count-Min Sketch and its Applications.*
/// - Einziger, Friedman, Manes (2017). *TinyLFU: A Highly Efficient Cache
///   Admission Policy.*
pub struct FrequencySketch<S = RandomState> {
    table: Option<Table>,
    build_hasher: S,
}

impl FrequencySketch<RandomState> {
    /// Creates an unsized sketch with a fresh random hasher.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl Default for FrequencySketch<RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BuildHasher> FrequencySketch<S> {
    /// Creates an unsized sketch that hashes keys with `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        FrequencySketch {
            table: None,
            build_hasher,
        }
    }

    /// Sizes the table so it can estimate the popularity of up to
    /// `maximum_size` entries.
    ///
    /// A no-op when the table already has at least that many slots.
    /// Otherwise a new zeroed table is allocated and all previous counts
    /// are discarded.
    ///
    /// # Errors
    /// [`Error::NegativeCapacity`] if `maximum_size < 0`; the sketch is left
    /// untouched.
    pub fn ensure_capacity(&mut self, maximum_size: i64) -> Result<()> {
        if maximum_size < 0 {
            return Err(Error::NegativeCapacity(maximum_size));
        }
        let maximum = maximum_size.min(MAX_SLOTS) as usize;
        if let Some(table) = &self.table {
            if table.words.len() >= maximum {
                return Ok(());
            }
        }

        let len = if maximum == 0 {
            1
        } else {
            maximum.next_power_of_two()
        };
        let sample_size = sample_size_for(maximum_size, maximum);
        debug!(maximum_size, len, sample_size, "sizing frequency sketch");

        self.table = Some(Table {
            words: vec![0u64; len].into_boxed_slice(),
            mask: len - 1,
            sample_size,
            size: 0,
        });
        Ok(())
    }

    /// Returns `false` until [`ensure_capacity`](Self::ensure_capacity) has
    /// been called.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.table.is_some()
    }

    /// Estimated number of recent occurrences of `key`, in `[0, 15]`.
    #[inline]
    pub fn frequency<K: Hash + ?Sized>(&self, key: &K) -> u8 {
        match &self.table {
            Some(table) => table.frequency(self.hash_of(key)),
            None => 0,
        }
    }

    /// Records one occurrence of `key`.
    ///
    /// Each of the key's four counters is bumped unless already saturated.
    /// May run an aging pass before returning.
    #[inline]
    pub fn increment<K: Hash + ?Sized>(&mut self, key: &K) {
        if self.table.is_none() {
            return;
        }
        let hash = self.hash_of(key);
        self.increment_hashed(hash);
    }

    /// Halves every counter.  Normally triggered by `increment`.
    pub fn reset(&mut self) {
        if let Some(table) = &mut self.table {
            table.reset();
        }
    }

    /// Number of 64-bit words in the table; 0 while unsized.
    pub fn table_len(&self) -> usize {
        self.table.as_ref().map_or(0, |t| t.words.len())
    }

    /// Increments between two aging passes; 0 while unsized.
    pub fn sample_size(&self) -> u32 {
        self.table.as_ref().map_or(0, |t| t.sample_size)
    }

    /// Successful increments since the last aging pass; 0 while unsized.
    pub fn size(&self) -> u32 {
        self.table.as_ref().map_or(0, |t| t.size)
    }

    fn increment_hashed(&mut self, hash: u32) {
        if let Some(table) = &mut self.table {
            if table.increment(hash) {
                trace!(
                    sample_size = table.sample_size,
                    "frequency sketch reached its sample size; aging"
                );
                table.reset();
            }
        }
    }

    /// Hashes `key` to 64 bits, folds it to 32 and mixes it with [`spread`].
    #[inline]
    fn hash_of<K: Hash + ?Sized>(&self, key: &K) -> u32 {
        let h = self.build_hasher.hash_one(key);
        spread((h ^ (h >> 32)) as u32)
    }
}

impl Table {
    #[inline]
    fn frequency(&self, hash: u32) -> u8 {
        let start = (hash & 3) << 2;
        let mut frequency = MAX_FREQUENCY;
        for depth in 0..4 {
            let index = self.index_of(hash, depth);
            let offset = (start + depth as u32) << 2;
            let count = ((self.words[index] >> offset) & 0xF) as u8;
            frequency = frequency.min(count);
        }
        frequency
    }

    /// Returns `true` when the sample size was reached and the table must age.
    #[inline]
    fn increment(&mut self, hash: u32) -> bool {
        let start = (hash & 3) << 2;
        let indexes = [
            self.index_of(hash, 0),
            self.index_of(hash, 1),
            self.index_of(hash, 2),
            self.index_of(hash, 3),
        ];

        let mut added = false;
        for (depth, &index) in indexes.iter().enumerate() {
            added |= self.increment_at(index, start + depth as u32);
        }

        if added {
            self.size += 1;
            return self.size >= self.sample_size;
        }
        false
    }

    /// Adds one to counter `counter` (0..16) of word `index` unless it holds
    /// 15 already.
    #[inline]
    fn increment_at(&mut self, index: usize, counter: u32) -> bool {
        let offset = counter << 2;
        let mask = 0xFu64 << offset;
        if self.words[index] & mask != mask {
            self.words[index] += 1u64 << offset;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        let mut odd = 0u64;
        for word in self.words.iter_mut() {
            odd += u64::from((*word & ONE_MASK).count_ones());
            *word = (*word >> 1) & RESET_MASK;
        }
        let halved = u64::from(self.size >> 1);
        self.size = halved.saturating_sub(odd >> 2) as u32;
    }

    /// Word index of the counter for `item` in row `depth`.
    #[inline]
    fn index_of(&self, item: u32, depth: usize) -> usize {
        let seed = SEEDS[depth];
        // sign-extending widen
        let mut hash = (item as i32 as u64).wrapping_add(seed).wrapping_mul(seed);
        hash = hash.wrapping_add(hash >> 32);
        (hash as u32 as usize) & self.mask
    }
}

/// `10 * maximum`, or 10 for an empty cache, capped at `i32::MAX`.
fn sample_size_for(maximum_size: i64, maximum: usize) -> u32 {
    if maximum_size == 0 {
        return 10;
    }
    (maximum as u64)
        .saturating_mul(10)
        .min(i32::MAX as u64) as u32
}

/// Supplemental hash defending against poor `Hash` implementations.
#[inline]
fn spread(x: u32) -> u32 {
    let x = ((x >> 16) ^ x).wrapping_mul(SPREAD_MULTIPLIER);
    let x = ((x >> 16) ^ x).wrapping_mul(SPREAD_MULTIPLIER);
    (x >> 16) ^ x
}
