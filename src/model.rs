//! Model layer: species, reactions, and propensity evaluation.
//!
//! A [`Model`] is constructed once and shared read-only across trajectories.
//! Propensities are evaluated through the [`PropensityEvaluator`] trait so
//! that generated or exotic rate laws can be injected without touching the
//! solver core; [`RateLawSet`] is the built-in implementation covering
//! mass-action, Hill, Michaelis-Menten and free-form expression kinetics.

use std::str::FromStr;

use meval::{Context, ContextProvider, Expr};
use thiserror::Error;

/// Species partition constants, shared with the Python layer.
pub const CONTINUOUS: i32 = 0;
pub const DISCRETE: i32 = 1;
pub const DYNAMIC: i32 = 2;

/// Solver family tags carried in solve reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverType {
    Ssa = 1,
    Ode = 2,
    Tau = 3,
    Hybrid = 4,
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// User-selected representation for a species.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeciesMode {
    Continuous,
    Discrete,
    Dynamic,
}

impl TryFrom<i32> for SpeciesMode {
    type Error = SimError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            CONTINUOUS => Ok(Self::Continuous),
            DISCRETE => Ok(Self::Discrete),
            DYNAMIC => Ok(Self::Dynamic),
            other => Err(SimError::InvalidArgument(format!(
                "unsupported species mode {} (expected 0=continuous, 1=discrete, or 2=dynamic)",
                other
            ))),
        }
    }
}

/// Effective representation of a species during one reporting step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionMode {
    Continuous = 0,
    Discrete = 1,
}

impl PartitionMode {
    #[inline]
    pub fn label(self) -> i32 {
        self as i32
    }
}

#[derive(Clone, Debug)]
pub struct Species {
    /// Dense 0-based id; doubles as the index into state vectors.
    pub id: usize,
    pub name: String,
    pub initial_population: i64,
    pub user_mode: SpeciesMode,
    /// sd/mean threshold below which a dynamic species is treated as
    /// continuous. Ignored when `switch_min` is present.
    pub switch_tol: f64,
    /// Population above which a dynamic species is treated as continuous.
    pub switch_min: Option<i64>,
}

impl Species {
    pub fn new(id: usize, name: impl Into<String>, initial_population: i64) -> Self {
        Self {
            id,
            name: name.into(),
            initial_population,
            user_mode: SpeciesMode::Dynamic,
            switch_tol: 0.03,
            switch_min: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Reaction {
    pub id: usize,
    pub name: String,
    /// Signed population change per firing, one entry per species.
    pub species_change: Vec<i64>,
    /// Reactions whose propensity is perturbed when this reaction fires.
    pub affected_reactions: Vec<usize>,
}

impl Reaction {
    pub fn new(id: usize, name: impl Into<String>, species_change: Vec<i64>) -> Self {
        Self {
            id,
            name: name.into(),
            species_change,
            affected_reactions: Vec::new(),
        }
    }
}

/// Immutable reaction network shared by all trajectories.
#[derive(Clone, Debug)]
pub struct Model {
    pub species: Vec<Species>,
    pub reactions: Vec<Reaction>,
}

impl Model {
    pub fn new(species: Vec<Species>, reactions: Vec<Reaction>) -> Result<Self, SimError> {
        if species.is_empty() {
            return Err(SimError::InvalidArgument(
                "model must contain at least one species".into(),
            ));
        }
        for (idx, spec) in species.iter().enumerate() {
            if spec.id != idx {
                return Err(SimError::InvalidArgument(format!(
                    "species ids must be contiguous: found id {} at position {}",
                    spec.id, idx
                )));
            }
            if spec.initial_population < 0 {
                return Err(SimError::InvalidArgument(format!(
                    "species '{}' has negative initial population {}",
                    spec.name, spec.initial_population
                )));
            }
            if !(spec.switch_tol > 0.0) {
                return Err(SimError::InvalidArgument(format!(
                    "species '{}' switch tolerance must be positive",
                    spec.name
                )));
            }
        }
        for (idx, rxn) in reactions.iter().enumerate() {
            if rxn.id != idx {
                return Err(SimError::InvalidArgument(format!(
                    "reaction ids must be contiguous: found id {} at position {}",
                    rxn.id, idx
                )));
            }
            if rxn.species_change.len() != species.len() {
                return Err(SimError::Shape(format!(
                    "reaction '{}' stoichiometry length {} does not match species count {}",
                    rxn.name,
                    rxn.species_change.len(),
                    species.len()
                )));
            }
        }
        Ok(Self { species, reactions })
    }

    #[inline]
    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    #[inline]
    pub fn n_reactions(&self) -> usize {
        self.reactions.len()
    }

    /// Populate each reaction's affected set from stoichiometric coupling:
    /// r' is affected by r when r changes a species that r' reads.
    /// `reads[r']` lists the species the propensity of r' depends on
    /// (see [`RateLawSet::reads`]).
    pub fn update_affected_reactions(&mut self, reads: &[Vec<usize>]) -> Result<(), SimError> {
        if reads.len() != self.reactions.len() {
            return Err(SimError::Shape(format!(
                "dependency rows {} do not match reaction count {}",
                reads.len(),
                self.reactions.len()
            )));
        }
        let mut species_readers: Vec<Vec<usize>> = vec![Vec::new(); self.species.len()];
        for (rxn, deps) in reads.iter().enumerate() {
            for &spec in deps {
                if spec >= self.species.len() {
                    return Err(SimError::InvalidArgument(format!(
                        "dependency of reaction {} refers to invalid species {}",
                        rxn, spec
                    )));
                }
                species_readers[spec].push(rxn);
            }
        }

        let n_reactions = self.reactions.len();
        let mut visit_markers = vec![0usize; n_reactions];
        let mut stamp = 1usize;
        for r in 0..n_reactions {
            if stamp == usize::MAX {
                visit_markers.fill(0);
                stamp = 1;
            }
            let mark = stamp;
            stamp += 1;

            let mut affected = Vec::new();
            for (spec, &delta) in self.reactions[r].species_change.iter().enumerate() {
                if delta == 0 {
                    continue;
                }
                for &reader in &species_readers[spec] {
                    if visit_markers[reader] != mark {
                        visit_markers[reader] = mark;
                        affected.push(reader);
                    }
                }
            }
            affected.sort_unstable();
            self.reactions[r].affected_reactions = affected;
        }
        Ok(())
    }
}

/// Scalar propensity evaluation over the three solver regimes.
///
/// The hybrid core itself only calls `ode_evaluate` (inside the ODE RHS)
/// and `tau_evaluate` (for the initial leap estimate); `evaluate` exists so
/// the same object can back a direct-SSA caller.
///
/// Contract: all three return a non-negative finite value for every state
/// actually reached, and a zero propensity contributes nothing to either
/// concentration derivatives or offset growth.
pub trait PropensityEvaluator: Sync {
    fn evaluate(&self, reaction: usize, state: &[i64]) -> f64;
    fn tau_evaluate(&self, reaction: usize, state: &[i64]) -> f64;
    fn ode_evaluate(&self, reaction: usize, state: &[f64]) -> f64;
}

#[derive(Clone, Debug)]
pub struct Reactant {
    pub species: usize,
    pub count: i64,
}

#[derive(Clone, Debug)]
pub enum RateLawKind {
    MassAction,
    Hill {
        activator: usize,
        hill_n: f64,
        #[allow(dead_code)] // kept for debugging, k_half_pow_n is used for performance
        k_half: f64,
        k_half_pow_n: f64,
    },
    MichaelisMenten {
        substrate: usize,
        k_m: f64,
    },
    Expression {
        expr: Expr,
        species_refs: Vec<usize>,
    },
}

#[derive(Clone, Debug)]
pub struct RateLaw {
    pub rate_constant: f64,
    pub reactants: Vec<Reactant>,
    pub kind: RateLawKind,
}

impl RateLaw {
    pub fn mass_action(rate_constant: f64, species_change: &[i64]) -> Self {
        Self {
            rate_constant,
            reactants: reactants_from_changes(species_change),
            kind: RateLawKind::MassAction,
        }
    }
}

/// Reactant list from a stoichiometry row: every species consumed by the
/// reaction, with its multiplicity.
pub fn reactants_from_changes(species_change: &[i64]) -> Vec<Reactant> {
    species_change
        .iter()
        .enumerate()
        .filter_map(|(species, &delta)| {
            (delta < 0).then_some(Reactant {
                species,
                count: -delta,
            })
        })
        .collect()
}

struct PopulationContext<'a> {
    state: &'a [i64],
}

impl<'a> ContextProvider for PopulationContext<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        parse_species_variable(name).map(|idx| self.state[idx].max(0) as f64)
    }
}

struct ConcentrationContext<'a> {
    state: &'a [f64],
}

impl<'a> ContextProvider for ConcentrationContext<'a> {
    fn get_var(&self, name: &str) -> Option<f64> {
        parse_species_variable(name).map(|idx| self.state[idx].max(0.0))
    }
}

/// The built-in [`PropensityEvaluator`]: one [`RateLaw`] per reaction.
#[derive(Clone, Debug)]
pub struct RateLawSet {
    laws: Vec<RateLaw>,
}

impl RateLawSet {
    pub fn new(laws: Vec<RateLaw>) -> Self {
        Self { laws }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.laws.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.laws.is_empty()
    }

    /// Species each reaction's propensity reads, used to populate the
    /// model's affected-reaction sets.
    pub fn reads(&self) -> Vec<Vec<usize>> {
        self.laws
            .iter()
            .map(|law| {
                let mut deps: Vec<usize> =
                    law.reactants.iter().map(|r| r.species).collect();
                match &law.kind {
                    RateLawKind::MassAction => {}
                    RateLawKind::Hill { activator, .. } => deps.push(*activator),
                    RateLawKind::MichaelisMenten { substrate, .. } => deps.push(*substrate),
                    RateLawKind::Expression { species_refs, .. } => {
                        deps.extend_from_slice(species_refs)
                    }
                }
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect()
    }

    fn law(&self, reaction: usize) -> &RateLaw {
        &self.laws[reaction]
    }
}

impl PropensityEvaluator for RateLawSet {
    fn evaluate(&self, reaction: usize, state: &[i64]) -> f64 {
        let law = self.law(reaction);
        match &law.kind {
            RateLawKind::MassAction => {
                let mut propensity = law.rate_constant;
                for reactant in &law.reactants {
                    let available = state[reactant.species];
                    if available < reactant.count {
                        return 0.0;
                    }
                    propensity *= falling_factorial(available, reactant.count);
                }
                propensity
            }
            RateLawKind::Hill {
                activator,
                hill_n,
                k_half_pow_n,
                ..
            } => hill_rate(
                law.rate_constant,
                state[*activator].max(0) as f64,
                *hill_n,
                *k_half_pow_n,
            ),
            RateLawKind::MichaelisMenten { substrate, k_m } => {
                michaelis_menten_rate(law.rate_constant, state[*substrate].max(0) as f64, *k_m)
            }
            RateLawKind::Expression { expr, .. } => {
                let ctx = (PopulationContext { state }, Context::new());
                expr.eval_with_context(ctx).unwrap_or(0.0).max(0.0)
            }
        }
    }

    fn tau_evaluate(&self, reaction: usize, state: &[i64]) -> f64 {
        self.evaluate(reaction, state)
    }

    fn ode_evaluate(&self, reaction: usize, state: &[f64]) -> f64 {
        let law = self.law(reaction);
        match &law.kind {
            RateLawKind::MassAction => {
                // Deterministic mass action: concentrations enter as plain
                // powers, not falling factorials.
                let mut propensity = law.rate_constant;
                for reactant in &law.reactants {
                    let x = state[reactant.species].max(0.0);
                    propensity *= match reactant.count {
                        1 => x,
                        2 => x * x,
                        n => x.powi(n as i32),
                    };
                }
                propensity
            }
            RateLawKind::Hill {
                activator,
                hill_n,
                k_half_pow_n,
                ..
            } => hill_rate(
                law.rate_constant,
                state[*activator].max(0.0),
                *hill_n,
                *k_half_pow_n,
            ),
            RateLawKind::MichaelisMenten { substrate, k_m } => {
                michaelis_menten_rate(law.rate_constant, state[*substrate].max(0.0), *k_m)
            }
            RateLawKind::Expression { expr, .. } => {
                let ctx = (ConcentrationContext { state }, Context::new());
                expr.eval_with_context(ctx).unwrap_or(0.0).max(0.0)
            }
        }
    }
}

#[inline]
fn hill_rate(rate_constant: f64, concentration: f64, hill_n: f64, k_half_pow_n: f64) -> f64 {
    let power = concentration.powf(hill_n);
    let denom = k_half_pow_n + power;
    if denom == 0.0 {
        0.0
    } else {
        rate_constant * power / denom
    }
}

#[inline]
fn michaelis_menten_rate(rate_constant: f64, substrate: f64, k_m: f64) -> f64 {
    let denom = k_m + substrate;
    if denom == 0.0 {
        0.0
    } else {
        rate_constant * substrate / denom
    }
}

#[inline]
pub(crate) fn falling_factorial(value: i64, count: i64) -> f64 {
    match count {
        0 => 1.0,
        1 => value as f64,
        2 if value >= 2 => (value * (value - 1)) as f64,
        3 if value >= 3 => (value * (value - 1) * (value - 2)) as f64,
        _ if value < count => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count {
                acc *= (value - i) as f64;
            }
            acc
        }
    }
}

fn parse_species_variable(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('s').or_else(|| name.strip_prefix('S'))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok()
}

/// Species indices referenced as `s<idx>` in a rate expression.
pub fn collect_species_refs(
    expr_str: &str,
    reaction_idx: usize,
    n_species: usize,
) -> Result<Vec<usize>, SimError> {
    let mut refs = Vec::new();
    let bytes = expr_str.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        let ch = bytes[idx];
        if ch == b's' || ch == b'S' {
            let mut end = idx + 1;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > idx + 1 {
                let digits = &expr_str[idx + 1..end];
                let species_idx = digits.parse::<usize>().map_err(|_| {
                    SimError::InvalidArgument(format!(
                        "reaction {} expression contains invalid species index '{}'",
                        reaction_idx, digits
                    ))
                })?;
                if species_idx >= n_species {
                    return Err(SimError::InvalidArgument(format!(
                        "reaction {} expression species index {} exceeds number of species {}",
                        reaction_idx, species_idx, n_species
                    )));
                }
                if !refs.contains(&species_idx) {
                    refs.push(species_idx);
                }
                idx = end;
                continue;
            }
        }
        idx += 1;
    }
    Ok(refs)
}

/// Compile a rate expression, resolving its species references.
pub fn compile_rate_expression(
    expr_str: &str,
    reaction_idx: usize,
    n_species: usize,
) -> Result<RateLawKind, SimError> {
    let expr = Expr::from_str(expr_str).map_err(|err| {
        SimError::InvalidArgument(format!(
            "reaction {} expression parse error: {}",
            reaction_idx, err
        ))
    })?;
    let species_refs = collect_species_refs(expr_str, reaction_idx, n_species)?;
    Ok(RateLawKind::Expression { expr, species_refs })
}
