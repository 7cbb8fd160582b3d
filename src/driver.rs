//! The hybrid tau-leaping driver.
//!
//! One call to [`tau_hybrid_solve`] produces an ensemble of independent
//! trajectories. Per trajectory the loop is strictly ordered:
//! snapshot -> ODE advance -> firing reconciliation -> commit-or-retry ->
//! sample emission. Reactions fire when their integrated offset crosses
//! zero; a firing that would drive a population negative rejects the whole
//! step, restores the snapshot, and retries with half the tau step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use log::{debug, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::model::{Model, PartitionMode, PropensityEvaluator, SimError, SolverType};
use crate::ode::{Bdf, OdeOptions, OdeSystem};
use crate::output::TrajectoryWriter;
use crate::state::{ln_uniform, HybridValue, PackedState, PartitionTracker};

pub(crate) const TIME_EPSILON: f64 = 1e-12;

/// Tau steps below this fraction of the reporting interval abort the
/// trajectory: repeated halving has hit the machine-precision floor.
const TAU_FLOOR_FACTOR: f64 = 1e-12;

/// Shared cancellation flag, observed at trajectory boundaries and between
/// reconciliation and sample emission. In-flight integrator steps are not
/// interrupted.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// Process-wide token for embedders that wire it to a signal handler.
    pub fn global() -> &'static CancellationToken {
        static GLOBAL: OnceLock<CancellationToken> = OnceLock::new();
        GLOBAL.get_or_init(CancellationToken::new)
    }
}

/// How one trajectory ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrajectoryStatus {
    Complete = 0,
    Interrupted = 1,
    IntegratorFatal = 2,
    TauUnderflow = 3,
}

/// Per-invocation result summary. Failed or interrupted trajectories keep
/// their partial samples; unwritten cells stay at the buffers' initial
/// values.
#[derive(Clone, Debug)]
pub struct SolveReport {
    pub solver: SolverType,
    pub statuses: Vec<TrajectoryStatus>,
    /// Timesteps actually emitted per trajectory.
    pub steps_written: Vec<usize>,
}

impl SolveReport {
    pub fn all_complete(&self) -> bool {
        self.statuses
            .iter()
            .all(|&s| s == TrajectoryStatus::Complete)
    }
}

#[derive(Clone, Debug)]
pub struct SolveOptions {
    /// Leap-condition control for the initial tau step.
    pub tau_tol: f64,
    pub rtol: f64,
    pub atol: f64,
    /// 0 requests a nondeterministic device seed.
    pub seed: u64,
    pub n_threads: Option<usize>,
    pub cancel: CancellationToken,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            tau_tol: 0.03,
            rtol: 1e-5,
            atol: 1e-12,
            seed: 0,
            n_threads: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// The packed ODE system: concentrations first, then one offset per
/// reaction growing at that reaction's propensity rate.
struct HybridRhs<'a, P: PropensityEvaluator> {
    model: &'a Model,
    evaluator: &'a P,
}

impl<'a, P: PropensityEvaluator> OdeSystem for HybridRhs<'a, P> {
    fn ndim(&self) -> usize {
        self.model.n_species() + self.model.n_reactions()
    }

    fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
        let n_species = self.model.n_species();
        let concentrations = &y[..n_species];
        dydt[..n_species].fill(0.0);

        for (r, reaction) in self.model.reactions.iter().enumerate() {
            let propensity = self.evaluator.ode_evaluate(r, concentrations).max(0.0);
            dydt[n_species + r] = propensity;

            for (s, &change) in reaction.species_change.iter().enumerate() {
                if change == 0 {
                    continue;
                }
                // Branchless sign: products push up, reactants pull down.
                dydt[s] += propensity * f64::from(-1 + 2 * i32::from(change > 0));
            }
        }
    }
}

/// Run `n_trajectories` hybrid tau-leaping trajectories of `model` over the
/// uniform reporting grid `timeline`, writing into the three caller-owned
/// flat `[trajectory][timestep][species]` buffers.
pub fn tau_hybrid_solve<P: PropensityEvaluator>(
    model: &Model,
    evaluator: &P,
    timeline: &[f64],
    n_trajectories: usize,
    options: &SolveOptions,
    ode_out: &mut [f64],
    counts_out: &mut [i64],
    modes_out: &mut [i32],
) -> Result<SolveReport, SimError> {
    let n_species = model.n_species();
    if timeline.len() < 2 {
        return Err(SimError::InvalidArgument(
            "timeline must contain at least two timesteps".into(),
        ));
    }
    let increment = timeline[1] - timeline[0];
    if !(increment > 0.0) {
        return Err(SimError::InvalidArgument(
            "timeline must be strictly increasing".into(),
        ));
    }
    for window in timeline.windows(2) {
        let step = window[1] - window[0];
        if !(step > 0.0) || (step - increment).abs() > 1e-9 * increment.max(1.0) {
            return Err(SimError::InvalidArgument(
                "timeline must be uniformly spaced and strictly increasing".into(),
            ));
        }
    }
    if n_trajectories == 0 {
        return Err(SimError::InvalidArgument(
            "number of trajectories must be greater than zero".into(),
        ));
    }
    if !(options.tau_tol > 0.0) {
        return Err(SimError::InvalidArgument("tau_tol must be positive".into()));
    }
    if !(options.rtol > 0.0) || !(options.atol > 0.0) {
        return Err(SimError::InvalidArgument(
            "integrator tolerances must be positive".into(),
        ));
    }
    let stride = timeline
        .len()
        .checked_mul(n_species)
        .ok_or_else(|| SimError::Shape("result tensor size exceeds allowable limits".into()))?;
    let total = stride
        .checked_mul(n_trajectories)
        .ok_or_else(|| SimError::Shape("result tensor size exceeds allowable limits".into()))?;
    for (name, len) in [
        ("continuous", ode_out.len()),
        ("count", counts_out.len()),
        ("mode", modes_out.len()),
    ] {
        if len != total {
            return Err(SimError::Shape(format!(
                "{} buffer length {} does not match {} trajectories x {} timesteps x {} species",
                name,
                len,
                n_trajectories,
                timeline.len(),
                n_species
            )));
        }
    }

    let base_seed = if options.seed == 0 {
        rand::random::<u64>()
    } else {
        options.seed
    };

    let mut simulate = || -> Vec<(TrajectoryStatus, usize)> {
        ode_out
            .par_chunks_mut(stride)
            .zip(counts_out.par_chunks_mut(stride))
            .zip(modes_out.par_chunks_mut(stride))
            .enumerate()
            .map(|(traj, ((ode, counts), modes))| {
                if options.cancel.is_cancelled() {
                    return (TrajectoryStatus::Interrupted, 0);
                }
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(base_seed, traj as u64));
                let writer = TrajectoryWriter::new(ode, counts, modes, n_species);
                run_trajectory(model, evaluator, timeline, options, &mut rng, writer)
            })
            .collect()
    };

    let results = match options.n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(|| simulate()),
        None => simulate(),
    };

    let (statuses, steps_written) = results.into_iter().unzip();
    Ok(SolveReport {
        solver: SolverType::Hybrid,
        statuses,
        steps_written,
    })
}

fn run_trajectory<P: PropensityEvaluator>(
    model: &Model,
    evaluator: &P,
    timeline: &[f64],
    options: &SolveOptions,
    rng: &mut ChaCha8Rng,
    mut writer: TrajectoryWriter<'_>,
) -> (TrajectoryStatus, usize) {
    let n_species = model.n_species();
    let n_reactions = model.n_reactions();
    let increment = timeline[1] - timeline[0];
    let start_time = timeline[0];
    let end_time = *timeline.last().unwrap();

    let mut populations: Vec<i64> = model
        .species
        .iter()
        .map(|s| s.initial_population)
        .collect();
    let mut tracker = PartitionTracker::new(model);
    let mut packed = PackedState::init(&populations, n_reactions, rng);
    let rhs = HybridRhs { model, evaluator };
    let ode_opts = OdeOptions {
        rtol: options.rtol,
        atol: options.atol,
        ..OdeOptions::default()
    };
    let mut integrator = match Bdf::new(&rhs, packed.as_slice(), start_time, ode_opts) {
        Ok(integrator) => integrator,
        Err(err) => {
            warn!("trajectory setup failed: {err}");
            return (TrajectoryStatus::IntegratorFatal, 0);
        }
    };

    emit_sample(&mut writer, 0, &packed, &populations, &mut tracker);
    let mut samples = 1usize;
    let mut save_index = 1usize;

    let mut current_time = start_time;
    let mut tau_step = initial_tau(increment, options.tau_tol, evaluator, &populations, n_reactions);
    let tau_floor = increment * TAU_FLOOR_FACTOR;
    let mut change_scratch = vec![0i64; n_species];

    while current_time < end_time - TIME_EPSILON {
        if options.cancel.is_cancelled() {
            return (TrajectoryStatus::Interrupted, samples);
        }
        if tau_step < tau_floor {
            warn!("tau step underflow at t={current_time:.6e}");
            return (TrajectoryStatus::TauUnderflow, samples);
        }

        let next_time = (current_time + tau_step).min(end_time);
        let state_snapshot = packed.snapshot();
        let pop_snapshot = populations.clone();

        if let Err(err) = integrator.advance(next_time) {
            warn!("trajectory aborted at t={current_time:.6e}: {err}");
            return (TrajectoryStatus::IntegratorFatal, samples);
        }
        packed.as_mut_slice().copy_from_slice(integrator.y());

        match reconcile_firings(model, &mut packed, &mut populations, &mut change_scratch, rng) {
            ReconcileOutcome::Rejected => {
                // A firing would have driven a population negative: roll
                // back and retry the interval with a smaller tau.
                packed.restore(&state_snapshot);
                populations.copy_from_slice(&pop_snapshot);
                integrator.reset(current_time, packed.as_slice());
                tau_step *= 0.5;
                debug!("step rejected at t={current_time:.6e}, tau halved to {tau_step:.3e}");
                continue;
            }
            ReconcileOutcome::Accepted { fired } => {
                // Discrete-partitioned species are authoritative on the
                // integer track: re-anchor their concentrations so the
                // propensities see the hybrid state. Committed firings also
                // rewrote reaction offsets behind the integrator's back;
                // either way the solver restarts from the reconciled state.
                let synced = sync_discrete_species(&mut packed, &populations, tracker.modes());
                if fired || synced {
                    integrator.reset(next_time, packed.as_slice());
                }
            }
        }

        current_time = next_time;
        let interrupted = options.cancel.is_cancelled();

        while save_index < timeline.len()
            && timeline[save_index] <= current_time + TIME_EPSILON
        {
            emit_sample(&mut writer, save_index, &packed, &populations, &mut tracker);
            save_index += 1;
            samples += 1;
        }
        if interrupted {
            return (TrajectoryStatus::Interrupted, samples);
        }

        // Recover toward the reporting interval after accepted steps.
        tau_step = (tau_step * 2.0).min(increment);
    }

    (TrajectoryStatus::Complete, samples)
}

/// Classify, resolve each species through its partition, and write one
/// timestep.
fn emit_sample(
    writer: &mut TrajectoryWriter<'_>,
    step: usize,
    packed: &PackedState,
    populations: &[i64],
    tracker: &mut PartitionTracker,
) {
    tracker.refresh();
    let concentrations = packed.concentrations();
    let values: Vec<HybridValue> = tracker
        .modes()
        .iter()
        .zip(populations.iter())
        .zip(concentrations.iter())
        .map(|((&mode, &pop), &conc)| match mode {
            PartitionMode::Discrete => HybridValue::Discrete(pop),
            PartitionMode::Continuous => HybridValue::Continuous(conc),
        })
        .collect();
    writer.emit(step, concentrations, &values, tracker.modes());
    tracker.observe(populations);
}

enum ReconcileOutcome {
    Accepted { fired: bool },
    Rejected,
}

/// Re-anchor discrete-partitioned species to their integer populations.
/// Returns true when any concentration entry changed.
fn sync_discrete_species(
    packed: &mut PackedState,
    populations: &[i64],
    modes: &[PartitionMode],
) -> bool {
    let mut changed = false;
    let concentrations = packed.concentrations_mut();
    for (s, &mode) in modes.iter().enumerate() {
        if mode != PartitionMode::Discrete {
            continue;
        }
        let anchored = populations[s] as f64;
        if concentrations[s] != anchored {
            concentrations[s] = anchored;
            changed = true;
        }
    }
    changed
}

/// Count and apply the firings accumulated in each reaction offset.
/// On `Rejected` a firing hit a negative-population path; no state was
/// modified for that reaction and the caller must retry from its snapshot.
fn reconcile_firings(
    model: &Model,
    packed: &mut PackedState,
    populations: &mut [i64],
    changes: &mut [i64],
    rng: &mut ChaCha8Rng,
) -> ReconcileOutcome {
    let mut fired = false;
    for (r, reaction) in model.reactions.iter().enumerate() {
        let mut rxn_state = packed.offsets()[r];
        if rxn_state < 0.0 {
            continue;
        }
        changes.fill(0);
        while rxn_state >= 0.0 {
            // Tentatively fire once.
            for (s, &delta) in reaction.species_change.iter().enumerate() {
                changes[s] += delta;
            }
            let negative = reaction
                .species_change
                .iter()
                .enumerate()
                .any(|(s, &delta)| delta != 0 && populations[s] + changes[s] < 0);
            if negative {
                return ReconcileOutcome::Rejected;
            }
            rxn_state += ln_uniform(rng);
            fired = true;
        }
        for (pop, &delta) in populations.iter_mut().zip(changes.iter()) {
            *pop += delta;
        }
        packed.offsets_mut()[r] = rxn_state;
    }
    ReconcileOutcome::Accepted { fired }
}

/// Leap-condition estimate for the first tau step: the reporting interval,
/// shortened when the initial propensity load would change populations by
/// more than `tau_tol` of their total.
fn initial_tau<P: PropensityEvaluator>(
    increment: f64,
    tau_tol: f64,
    evaluator: &P,
    populations: &[i64],
    n_reactions: usize,
) -> f64 {
    let total_propensity: f64 = (0..n_reactions)
        .map(|r| evaluator.tau_evaluate(r, populations).max(0.0))
        .sum();
    if total_propensity <= 0.0 {
        return increment;
    }
    let total_population: i64 = populations.iter().sum();
    increment.min(tau_tol * (1.0 + total_population as f64) / total_propensity)
}

/// SplitMix64 per-trajectory seed stream.
fn derive_seed(base: u64, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let mut z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RateLaw, RateLawSet, Reaction, Species};

    fn decay_model() -> (Model, RateLawSet) {
        let species = vec![Species::new(0, "A", 1)];
        let reactions = vec![Reaction::new(0, "decay", vec![-1])];
        let laws = RateLawSet::new(vec![RateLaw::mass_action(100.0, &[-1])]);
        (Model::new(species, reactions).unwrap(), laws)
    }

    #[test]
    fn derive_seed_is_deterministic() {
        let s1 = derive_seed(42, 5);
        let s2 = derive_seed(42, 5);
        assert_eq!(s1, s2);
        assert_ne!(derive_seed(42, 5), derive_seed(42, 6));
    }

    #[test]
    fn reconcile_fires_until_offset_goes_negative() {
        let (model, _) = decay_model();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut packed = PackedState::init(&[10], 1, &mut rng);
        // Force at least one pending firing.
        packed.offsets_mut()[0] = 0.3;
        let mut populations = vec![10i64];
        let mut scratch = vec![0i64; 1];
        let outcome =
            reconcile_firings(&model, &mut packed, &mut populations, &mut scratch, &mut rng);
        assert!(matches!(outcome, ReconcileOutcome::Accepted { fired: true }));
        assert!(populations[0] < 10);
        assert!(populations[0] >= 0);
        assert!(packed.offsets()[0] < 0.0);
    }

    #[test]
    fn reconcile_rejects_negative_population_path() {
        let (model, _) = decay_model();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut packed = PackedState::init(&[0], 1, &mut rng);
        packed.offsets_mut()[0] = 0.1;
        let mut populations = vec![0i64];
        let mut scratch = vec![0i64; 1];
        let before = packed.offsets()[0];
        let outcome =
            reconcile_firings(&model, &mut packed, &mut populations, &mut scratch, &mut rng);
        assert!(matches!(outcome, ReconcileOutcome::Rejected));
        // Rejection leaves the state untouched.
        assert_eq!(populations[0], 0);
        assert_eq!(packed.offsets()[0], before);
    }

    #[test]
    fn initial_tau_respects_leap_condition() {
        let (_, laws) = decay_model();
        // Propensity 100 on a single molecule: tau shrinks well below the
        // reporting interval.
        let tau = initial_tau(1.0, 0.03, &laws, &[1], 1);
        assert!(tau < 1e-3);
        // Zero propensity falls back to the full interval.
        let tau = initial_tau(1.0, 0.03, &laws, &[0], 1);
        assert_eq!(tau, 1.0);
    }
}
