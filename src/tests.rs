use super::*;
use crate::model::falling_factorial;

fn uniform_timeline(end_time: f64, n_steps: usize) -> Vec<f64> {
    let dt = end_time / (n_steps - 1) as f64;
    (0..n_steps).map(|i| i as f64 * dt).collect()
}

fn assemble(
    species: Vec<Species>,
    stoich: Vec<Vec<i64>>,
    laws: Vec<RateLaw>,
) -> (Model, RateLawSet) {
    let reactions = stoich
        .into_iter()
        .enumerate()
        .map(|(i, row)| Reaction::new(i, format!("r{i}"), row))
        .collect();
    let laws = RateLawSet::new(laws);
    let mut model = Model::new(species, reactions).unwrap();
    model.update_affected_reactions(&laws.reads()).unwrap();
    (model, laws)
}

#[derive(Debug)]
struct RunResult {
    ode: Vec<f64>,
    counts: Vec<i64>,
    modes: Vec<i32>,
    report: SolveReport,
}

fn run_solver(
    model: &Model,
    laws: &RateLawSet,
    timeline: &[f64],
    n_trajectories: usize,
    options: &SolveOptions,
) -> Result<RunResult, SimError> {
    let total = n_trajectories * timeline.len() * model.n_species();
    let mut ode = vec![0.0f64; total];
    let mut counts = vec![0i64; total];
    let mut modes = vec![0i32; total];
    let report = tau_hybrid_solve(
        model,
        laws,
        timeline,
        n_trajectories,
        options,
        &mut ode,
        &mut counts,
        &mut modes,
    )?;
    Ok(RunResult {
        ode,
        counts,
        modes,
        report,
    })
}

fn seeded(seed: u64) -> SolveOptions {
    SolveOptions {
        seed,
        n_threads: Some(1),
        ..SolveOptions::default()
    }
}

fn decay_species(population: i64, mode: SpeciesMode) -> Vec<Species> {
    let mut spec = Species::new(0, "A", population);
    spec.user_mode = mode;
    vec![spec]
}

fn birth_death_model() -> (Model, RateLawSet) {
    // 0 -> A at rate 10, A -> 0 at rate A.
    let species = decay_species(0, SpeciesMode::Dynamic);
    let stoich = vec![vec![1], vec![-1]];
    let laws = vec![
        RateLaw::mass_action(10.0, &[1]),
        RateLaw::mass_action(1.0, &[-1]),
    ];
    assemble(species, stoich, laws)
}

#[test]
fn empty_reaction_network_holds_populations() {
    let mut a = Species::new(0, "A", 5);
    a.user_mode = SpeciesMode::Continuous;
    let mut b = Species::new(1, "B", 7);
    b.user_mode = SpeciesMode::Discrete;
    let (model, laws) = assemble(vec![a, b], Vec::new(), Vec::new());

    let timeline = uniform_timeline(1.0, 11);
    let result = run_solver(&model, &laws, &timeline, 2, &seeded(42)).unwrap();

    assert!(result.report.all_complete());
    assert_eq!(result.report.steps_written, vec![11, 11]);
    for cell in result.ode.chunks(2) {
        assert_eq!(cell, &[5.0, 7.0]);
    }
    for cell in result.counts.chunks(2) {
        assert_eq!(cell, &[5, 7]);
    }
    for cell in result.modes.chunks(2) {
        assert_eq!(cell, &[model::CONTINUOUS, model::DISCRETE]);
    }
}

#[test]
fn pure_decay_tracks_exponential() {
    let species = decay_species(1000, SpeciesMode::Continuous);
    let (model, laws) = assemble(
        species,
        vec![vec![-1]],
        vec![RateLaw::mass_action(1.0, &[-1])],
    );

    let timeline = uniform_timeline(5.0, 51);
    let result = run_solver(&model, &laws, &timeline, 1, &seeded(7)).unwrap();
    assert!(result.report.all_complete());

    for (step, &t) in timeline.iter().enumerate() {
        let value = result.ode[step];
        let expected = 1000.0 * (-t).exp();
        assert!(
            (value - expected).abs() <= 1e-2 * expected.max(1.0),
            "t={t}: got {value}, expected {expected}"
        );
        assert!(value >= 0.0);
        // Continuous species resolve to the rounded integrated state.
        assert_eq!(result.counts[step], value.round() as i64);
        assert_eq!(result.modes[step], model::CONTINUOUS);
    }
    let final_value = *result.ode.last().unwrap();
    assert!(
        (6.5..=7.0).contains(&final_value),
        "A(5) = {final_value} outside [6.5, 7.0]"
    );
}

#[test]
fn fixed_seed_is_bit_reproducible() {
    let (model, laws) = birth_death_model();
    let timeline = uniform_timeline(5.0, 21);
    let options = SolveOptions {
        seed: 123,
        n_threads: Some(2),
        ..SolveOptions::default()
    };

    let first = run_solver(&model, &laws, &timeline, 3, &options).unwrap();
    let second = run_solver(&model, &laws, &timeline, 3, &options).unwrap();
    assert_eq!(first.ode, second.ode);
    assert_eq!(first.counts, second.counts);
    assert_eq!(first.modes, second.modes);
    assert_eq!(first.report.statuses, second.report.statuses);
}

#[test]
fn birth_death_reaches_equilibrium() {
    let (model, laws) = birth_death_model();
    let timeline = uniform_timeline(20.0, 41);
    let n_trajectories = 500;
    let result = run_solver(&model, &laws, &timeline, n_trajectories, &seeded(2024)).unwrap();

    let n_steps = timeline.len();
    let mut total = 0.0;
    let mut completed = 0usize;
    for traj in 0..n_trajectories {
        if result.report.statuses[traj] != TrajectoryStatus::Complete {
            continue;
        }
        total += result.counts[(traj + 1) * n_steps - 1] as f64;
        completed += 1;
    }
    assert!(
        completed * 2 > n_trajectories,
        "only {completed}/{n_trajectories} trajectories completed"
    );
    let mean = total / completed as f64;
    assert!(
        (9.0..=11.0).contains(&mean),
        "ensemble mean {mean} outside [9, 11]"
    );

    // Populations never go negative on the discrete track.
    assert!(result.counts.iter().all(|&c| c >= 0));

    // A noisy population of ~10 stays classified discrete once the
    // variation window fills.
    for traj in 0..n_trajectories {
        if result.report.statuses[traj] != TrajectoryStatus::Complete {
            continue;
        }
        assert_eq!(result.modes[(traj + 1) * n_steps - 1], model::DISCRETE);
    }
}

#[test]
fn discrete_death_ensemble_matches_exact_statistics() {
    // A -> 0 at rate A with every species pinned discrete and a fine
    // reporting grid. The exact jump process has A(t) ~ Binomial(A0, e^-t),
    // so the ensemble mean carries a standard error of
    // sqrt(A0 * p * (1 - p) / n) with p = e^-t; the solver's ensemble mean
    // must land within 3 sigma of the exact mean.
    let a0 = 20i64;
    let species = decay_species(a0, SpeciesMode::Discrete);
    let (model, laws) = assemble(
        species,
        vec![vec![-1]],
        vec![RateLaw::mass_action(1.0, &[-1])],
    );

    let end_time = 0.5;
    let timeline = uniform_timeline(end_time, 101);
    let n_trajectories = 1000;
    let result = run_solver(&model, &laws, &timeline, n_trajectories, &seeded(97)).unwrap();
    assert!(result.report.all_complete());

    let n_steps = timeline.len();
    let mut total = 0i64;
    for traj in 0..n_trajectories {
        let row = &result.counts[traj * n_steps..(traj + 1) * n_steps];
        // Death-only populations never grow and never go negative.
        for pair in row.windows(2) {
            assert!(pair[1] <= pair[0], "population grew: {pair:?}");
            assert!(pair[1] >= 0);
        }
        total += row[n_steps - 1];
    }

    let survival = (-end_time).exp();
    let exact_mean = a0 as f64 * survival;
    let std_error =
        (a0 as f64 * survival * (1.0 - survival) / n_trajectories as f64).sqrt();
    let mean = total as f64 / n_trajectories as f64;
    assert!(
        (mean - exact_mean).abs() <= 3.0 * std_error,
        "ensemble mean {mean} deviates from exact {exact_mean} by more than 3 sigma ({std_error})"
    );
}

#[test]
fn dimerization_conserves_total_monomer() {
    // 2A <-> B; A + 2B is invariant under both firings.
    let mut a = Species::new(0, "A", 100);
    a.user_mode = SpeciesMode::Discrete;
    let mut b = Species::new(1, "B", 0);
    b.user_mode = SpeciesMode::Discrete;
    let (model, laws) = assemble(
        vec![a, b],
        vec![vec![-2, 1], vec![2, -1]],
        vec![
            RateLaw::mass_action(0.01, &[-2, 1]),
            RateLaw::mass_action(1.0, &[2, -1]),
        ],
    );

    let timeline = uniform_timeline(5.0, 51);
    let result = run_solver(&model, &laws, &timeline, 2, &seeded(5)).unwrap();
    assert!(result.report.all_complete());

    for cell in result.counts.chunks(2) {
        assert!(cell[0] >= 0 && cell[1] >= 0);
        assert_eq!(cell[0] + 2 * cell[1], 100, "conservation broken: {cell:?}");
    }
}

#[test]
fn step_rejection_keeps_single_molecule_valid() {
    // One molecule decaying at rate 100 against a coarse reporting grid:
    // the first firing exhausts the population and later pending firings
    // must reject rather than drive it negative.
    let species = decay_species(1, SpeciesMode::Discrete);
    let (model, laws) = assemble(
        species,
        vec![vec![-1]],
        vec![RateLaw::mass_action(100.0, &[-1])],
    );

    let timeline = uniform_timeline(1.0, 2);
    let result = run_solver(&model, &laws, &timeline, 8, &seeded(31)).unwrap();

    assert!(result.report.all_complete());
    assert!(result.counts.iter().all(|&c| c == 0 || c == 1));
}

#[test]
fn preset_interrupt_leaves_buffers_untouched() {
    let (model, laws) = birth_death_model();
    let timeline = uniform_timeline(10.0, 21);
    let options = seeded(9);
    options.cancel.cancel();

    let result = run_solver(&model, &laws, &timeline, 4, &options).unwrap();
    assert!(result
        .report
        .statuses
        .iter()
        .all(|&s| s == TrajectoryStatus::Interrupted));
    assert_eq!(result.report.steps_written, vec![0, 0, 0, 0]);
    assert!(result.ode.iter().all(|&v| v == 0.0));
    assert!(result.counts.iter().all(|&c| c == 0));
    assert!(result.modes.iter().all(|&m| m == 0));
}

#[test]
fn solver_validates_inputs() {
    let (model, laws) = birth_death_model();
    let good_timeline = uniform_timeline(1.0, 11);

    // Degenerate timeline.
    let err = run_solver(&model, &laws, &[0.0], 1, &seeded(1)).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("timeline")));

    // Non-uniform spacing.
    let err = run_solver(&model, &laws, &[0.0, 0.1, 0.3], 1, &seeded(1)).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("uniformly")));

    // Decreasing timeline.
    let err = run_solver(&model, &laws, &[0.0, -0.1], 1, &seeded(1)).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(_)));

    // Zero trajectories.
    let err = run_solver(&model, &laws, &good_timeline, 0, &seeded(1)).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("trajectories")));

    // Mismatched output buffers.
    let mut ode = vec![0.0; 3];
    let mut counts = vec![0i64; 3];
    let mut modes = vec![0i32; 3];
    let err = tau_hybrid_solve(
        &model,
        &laws,
        &good_timeline,
        1,
        &seeded(1),
        &mut ode,
        &mut counts,
        &mut modes,
    )
    .unwrap_err();
    assert!(matches!(err, SimError::Shape(_)));
}

#[test]
fn model_validates_species_and_reactions() {
    let err = Model::new(vec![Species::new(0, "A", -3)], Vec::new()).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("negative")));

    let err = Model::new(vec![Species::new(1, "A", 0)], Vec::new()).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("contiguous")));

    let err = Model::new(
        vec![Species::new(0, "A", 0)],
        vec![Reaction::new(0, "r0", vec![1, -1])],
    )
    .unwrap_err();
    assert!(matches!(err, SimError::Shape(_)));
}

#[test]
fn affected_reactions_follow_stoichiometric_coupling() {
    let (model, _) = birth_death_model();
    // Birth changes A, which only the death propensity reads.
    assert_eq!(model.reactions[0].affected_reactions, vec![1]);
    // Death also changes A.
    assert_eq!(model.reactions[1].affected_reactions, vec![1]);
}

#[test]
fn mass_action_regimes_differ_on_multiplicity() {
    // 2A -> B with k=1: discrete uses the falling factorial, the ODE
    // regime uses the plain square.
    let law = RateLaw::mass_action(1.0, &[-2, 1]);
    let laws = RateLawSet::new(vec![law]);
    assert_eq!(laws.evaluate(0, &[5, 0]), 20.0);
    assert_eq!(laws.tau_evaluate(0, &[5, 0]), 20.0);
    assert_eq!(laws.ode_evaluate(0, &[5.0, 0.0]), 25.0);
    // Below the stoichiometric threshold nothing fires.
    assert_eq!(laws.evaluate(0, &[1, 0]), 0.0);
}

#[test]
fn hill_and_michaelis_menten_propensities_behave() {
    let hill = RateLaw {
        rate_constant: 10.0,
        reactants: Vec::new(),
        kind: RateLawKind::Hill {
            activator: 0,
            hill_n: 2.0,
            k_half: 3.0,
            k_half_pow_n: 9.0,
        },
    };
    let mm = RateLaw {
        rate_constant: 8.0,
        reactants: Vec::new(),
        kind: RateLawKind::MichaelisMenten {
            substrate: 0,
            k_m: 4.0,
        },
    };
    let laws = RateLawSet::new(vec![hill, mm]);
    // 10 * 16 / (9 + 16)
    assert!((laws.evaluate(0, &[4]) - 6.4).abs() < 1e-12);
    assert!((laws.ode_evaluate(0, &[4.0]) - 6.4).abs() < 1e-12);
    // 8 * 6 / (4 + 6)
    assert!((laws.evaluate(1, &[6]) - 4.8).abs() < 1e-12);
    assert!((laws.ode_evaluate(1, &[6.0]) - 4.8).abs() < 1e-12);
}

#[test]
fn expression_propensities_evaluate_and_clamp() {
    let kind = compile_rate_expression("2.0 * s0 + s1", 0, 2).unwrap();
    let negative = compile_rate_expression("0 - s0", 1, 2).unwrap();
    let laws = RateLawSet::new(vec![
        RateLaw {
            rate_constant: 1.0,
            reactants: Vec::new(),
            kind,
        },
        RateLaw {
            rate_constant: 1.0,
            reactants: Vec::new(),
            kind: negative,
        },
    ]);
    assert!((laws.evaluate(0, &[3, 5]) - 11.0).abs() < 1e-12);
    assert!((laws.ode_evaluate(0, &[3.0, 5.0]) - 11.0).abs() < 1e-12);
    // The propensity contract forbids negative rates.
    assert_eq!(laws.evaluate(1, &[3, 0]), 0.0);
}

#[test]
fn expression_species_refs_validate() {
    let refs = model::collect_species_refs("2*s0 + 3*S0 + s2", 0, 3).unwrap();
    assert_eq!(refs, vec![0, 2]);
    let err = compile_rate_expression("s5 + 1", 1, 2).unwrap_err();
    assert!(matches!(err, SimError::InvalidArgument(msg) if msg.contains("exceeds")));
}

#[test]
fn falling_factorial_basics() {
    assert_eq!(falling_factorial(5, 0), 1.0);
    assert_eq!(falling_factorial(5, 2), 20.0);
    assert_eq!(falling_factorial(3, 4), 0.0);
}

#[test]
fn partition_tracker_classifies_dynamic_species() {
    let mut spec = Species::new(0, "A", 0);
    spec.user_mode = SpeciesMode::Dynamic;
    spec.switch_tol = 0.03;
    let model = Model::new(vec![spec], Vec::new()).unwrap();

    // A steady population has zero variation: continuous.
    let mut tracker = PartitionTracker::new(&model);
    for _ in 0..10 {
        tracker.observe(&[100]);
    }
    tracker.refresh();
    assert_eq!(tracker.modes()[0], PartitionMode::Continuous);

    // A strongly fluctuating population flips to discrete.
    let mut tracker = PartitionTracker::new(&model);
    for i in 0..10 {
        tracker.observe(&[if i % 2 == 0 { 1 } else { 3 }]);
    }
    tracker.refresh();
    assert_eq!(tracker.modes()[0], PartitionMode::Discrete);
}

#[test]
fn partition_tracker_honors_switch_min() {
    let mut spec = Species::new(0, "A", 0);
    spec.user_mode = SpeciesMode::Dynamic;
    spec.switch_min = Some(5);
    let model = Model::new(vec![spec], Vec::new()).unwrap();

    // Noisy but above the population floor: continuous regardless of sd.
    let mut tracker = PartitionTracker::new(&model);
    for i in 0..10 {
        tracker.observe(&[if i % 2 == 0 { 8 } else { 14 }]);
    }
    tracker.refresh();
    assert_eq!(tracker.modes()[0], PartitionMode::Continuous);

    // Below the floor: discrete.
    let mut tracker = PartitionTracker::new(&model);
    for _ in 0..10 {
        tracker.observe(&[2]);
    }
    tracker.refresh();
    assert_eq!(tracker.modes()[0], PartitionMode::Discrete);
}

#[test]
fn pinned_modes_never_switch() {
    let mut spec = Species::new(0, "A", 0);
    spec.user_mode = SpeciesMode::Discrete;
    let model = Model::new(vec![spec], Vec::new()).unwrap();
    let mut tracker = PartitionTracker::new(&model);
    for _ in 0..10 {
        tracker.observe(&[1000]);
    }
    tracker.refresh();
    assert_eq!(tracker.modes()[0], PartitionMode::Discrete);
}

#[test]
fn hybrid_value_resolution() {
    assert_eq!(HybridValue::Discrete(7).count(), 7);
    assert_eq!(HybridValue::Continuous(6.6).count(), 7);
    assert_eq!(HybridValue::Continuous(-0.4).count(), 0);
}

#[test]
fn write_results_formats_rows() {
    let timeline = [0.0, 1.0];
    // 2 trajectories x 2 timesteps x 2 species.
    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    let mut out = Vec::new();
    write_results(&mut out, &timeline, &values, 2, 2).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text, "0 1 2\n1 3 4\n\n0 5 6\n1 7 8\n");
}

#[test]
fn packed_state_splits_and_restores() {
    use rand::SeedableRng;
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
    let mut packed = PackedState::init(&[4, 9], 3, &mut rng);
    assert_eq!(packed.concentrations(), &[4.0, 9.0]);
    assert_eq!(packed.offsets().len(), 3);
    // Offsets start strictly negative.
    assert!(packed.offsets().iter().all(|&o| o < 0.0));

    let snapshot = packed.snapshot();
    packed.as_mut_slice()[0] = 17.0;
    packed.offsets_mut()[2] = 0.5;
    packed.restore(&snapshot);
    assert_eq!(packed.as_slice(), snapshot.as_slice());
}
