//! Per-trajectory simulation state.
//!
//! The integrator sees one contiguous real vector per trajectory:
//!
//! ```text
//! [ --- concentrations --- | --- reaction offsets --- ]
//!   0 .. n_species           n_species .. n_species + n_reactions
//! ```
//!
//! Each reaction offset starts at `ln(U)`, `U ~ Uniform(0,1)` open on both
//! ends, and grows at the reaction's propensity rate during integration.
//! A non-negative offset signals accumulated firings to reconcile.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::model::{Model, PartitionMode, SpeciesMode};

/// Draw `ln(U)` with `U` strictly inside (0,1). `ln(0)` would never return
/// from the reconciliation loop and `ln(1) = 0` would not decrement it.
#[inline]
pub(crate) fn ln_uniform(rng: &mut ChaCha8Rng) -> f64 {
    loop {
        let u: f64 = rng.r#gen();
        if u > 0.0 && u < 1.0 {
            return u.ln();
        }
    }
}

/// The unified integrator vector for one trajectory.
#[derive(Clone, Debug)]
pub struct PackedState {
    data: Vec<f64>,
    n_species: usize,
}

impl PackedState {
    /// Concentrations from the initial populations, offsets from fresh
    /// `ln(U)` draws.
    pub fn init(populations: &[i64], n_reactions: usize, rng: &mut ChaCha8Rng) -> Self {
        let n_species = populations.len();
        let mut data = Vec::with_capacity(n_species + n_reactions);
        data.extend(populations.iter().map(|&p| p as f64));
        data.extend((0..n_reactions).map(|_| ln_uniform(rng)));
        Self { data, n_species }
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    #[inline]
    pub fn concentrations(&self) -> &[f64] {
        &self.data[..self.n_species]
    }

    #[inline]
    pub fn concentrations_mut(&mut self) -> &mut [f64] {
        &mut self.data[..self.n_species]
    }

    #[inline]
    pub fn offsets(&self) -> &[f64] {
        &self.data[self.n_species..]
    }

    #[inline]
    pub fn offsets_mut(&mut self) -> &mut [f64] {
        &mut self.data[self.n_species..]
    }

    pub fn snapshot(&self) -> Vec<f64> {
        self.data.clone()
    }

    pub fn restore(&mut self, snapshot: &[f64]) {
        self.data.copy_from_slice(snapshot);
    }
}

/// A species value at emit time: the discrete track carries exact integer
/// populations, the continuous track carries the integrated concentration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HybridValue {
    Discrete(i64),
    Continuous(f64),
}

impl HybridValue {
    /// Integer population for the discrete result tensor.
    #[inline]
    pub fn count(self) -> i64 {
        match self {
            HybridValue::Discrete(n) => n,
            HybridValue::Continuous(x) => (x.round() as i64).max(0),
        }
    }
}

const PARTITION_WINDOW: usize = 10;

/// Rolling classification of dynamic species.
///
/// Keeps a short per-species population window across reporting steps and
/// reclassifies each dynamic species at the start of every step: continuous
/// when the mean population clears `switch_min` (if given) or when the
/// coefficient of variation drops to `switch_tol`, discrete otherwise.
/// Species pinned by the user never change mode.
#[derive(Clone, Debug)]
pub struct PartitionTracker {
    modes: Vec<PartitionMode>,
    user_modes: Vec<SpeciesMode>,
    switch_tol: Vec<f64>,
    switch_min: Vec<Option<i64>>,
    window: Vec<f64>,
    filled: usize,
    head: usize,
}

impl PartitionTracker {
    pub fn new(model: &Model) -> Self {
        let n = model.n_species();
        let modes = model
            .species
            .iter()
            .map(|s| match s.user_mode {
                SpeciesMode::Discrete => PartitionMode::Discrete,
                // Dynamic species start continuous until a window accrues.
                SpeciesMode::Continuous | SpeciesMode::Dynamic => PartitionMode::Continuous,
            })
            .collect();
        Self {
            modes,
            user_modes: model.species.iter().map(|s| s.user_mode).collect(),
            switch_tol: model.species.iter().map(|s| s.switch_tol).collect(),
            switch_min: model.species.iter().map(|s| s.switch_min).collect(),
            window: vec![0.0; n * PARTITION_WINDOW],
            filled: 0,
            head: 0,
        }
    }

    #[inline]
    pub fn modes(&self) -> &[PartitionMode] {
        &self.modes
    }

    /// Record the populations emitted at a reporting step.
    pub fn observe(&mut self, populations: &[i64]) {
        let n = self.modes.len();
        debug_assert_eq!(populations.len(), n);
        for (s, &p) in populations.iter().enumerate() {
            self.window[s * PARTITION_WINDOW + self.head] = p as f64;
        }
        self.head = (self.head + 1) % PARTITION_WINDOW;
        self.filled = (self.filled + 1).min(PARTITION_WINDOW);
    }

    /// Reclassify dynamic species from the current window.
    pub fn refresh(&mut self) {
        if self.filled < 2 {
            return;
        }
        for s in 0..self.modes.len() {
            if self.user_modes[s] != SpeciesMode::Dynamic {
                continue;
            }
            let samples = &self.window[s * PARTITION_WINDOW..s * PARTITION_WINDOW + self.filled];
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            let continuous = if let Some(min) = self.switch_min[s] {
                mean >= min as f64
            } else if mean > 0.0 {
                let var = samples
                    .iter()
                    .map(|&x| (x - mean) * (x - mean))
                    .sum::<f64>()
                    / (samples.len() - 1) as f64;
                var.sqrt() / mean <= self.switch_tol[s]
            } else {
                false
            };
            self.modes[s] = if continuous {
                PartitionMode::Continuous
            } else {
                PartitionMode::Discrete
            };
        }
    }
}
