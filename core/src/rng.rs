//! Deterministic random number generation.
//!
//! RULE: No model may call any platform RNG.
//! All randomness flows through ModelRng instances derived
//! from the single master seed stored on the PipelineRun.
//!
//! Each model gets its own RNG stream, seeded deterministically
//! from (master_seed XOR slot_index). This means:
//!   - Adding a new model never changes existing models' streams.
//!   - Each model's stream is reproducible in isolation, so running
//!     the models concurrently cannot change their output.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for a single model.
pub struct ModelRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl ModelRng {
    /// Create a model RNG from the master seed and a stable
    /// slot index. The index must never change once assigned.
    pub fn new(master_seed: u64, slot_index: u64) -> Self {
        let derived_seed = master_seed ^ (slot_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a usize in [0, n).
    pub fn next_below(&mut self, n: usize) -> usize {
        use rand::RngCore;
        assert!(n > 0, "n must be > 0");
        (self.inner.next_u64() % n as u64) as usize
    }

    /// Uniform float in [lo, hi).
    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Draw `k` distinct indices from [0, n) (partial Fisher-Yates).
    /// Returns all n indices, shuffled, when k >= n.
    pub fn sample_indices(&mut self, n: usize, k: usize) -> Vec<usize> {
        let mut pool: Vec<usize> = (0..n).collect();
        let take = k.min(n);
        for i in 0..take {
            let j = i + self.next_below(n - i);
            pool.swap(i, j);
        }
        pool.truncate(take);
        pool
    }
}

/// All model RNGs for a single run, indexed by stable slot.
#[derive(Debug, Clone, Copy)]
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn for_model(&self, slot: ModelSlot) -> ModelRng {
        ModelRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable model slot assignments.
/// NEVER reorder or remove entries — only append.
/// Reordering changes every model's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ModelSlot {
    Segmentation = 0,
    Anomaly = 1,
    Forecast = 2,
    // Add new models here — append only.
}

impl ModelSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::Anomaly => "anomaly",
            Self::Forecast => "forecast",
        }
    }
}
