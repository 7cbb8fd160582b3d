use numpy::{
    Element, IxDyn, PyArrayDyn, PyArrayMethods, PyReadonlyArray1, PyReadonlyArray2,
    PyUntypedArrayMethods,
};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

pub mod driver;
pub mod model;
pub mod ode;
pub mod output;
pub mod state;

pub use driver::{
    tau_hybrid_solve, CancellationToken, SolveOptions, SolveReport, TrajectoryStatus,
};
pub use model::{
    compile_rate_expression, reactants_from_changes, Model, PartitionMode, PropensityEvaluator,
    RateLaw, RateLawKind, RateLawSet, Reaction, SimError, SolverType, Species, SpeciesMode,
};
pub use output::{write_results, TrajectoryWriter};
pub use state::{HybridValue, PackedState, PartitionTracker};

impl From<SimError> for PyErr {
    fn from(err: SimError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

fn flatten_pyarray2<T: Copy + Element>(
    array: PyReadonlyArray2<T>,
    name: &str,
) -> Result<(usize, usize, Vec<T>), SimError> {
    let shape = array.shape();
    if shape.len() != 2 {
        return Err(SimError::Shape(format!("{name} must be 2-dimensional")));
    }
    let data = array
        .as_slice()
        .map_err(|_| SimError::Shape(format!("{name} must be contiguous")))?;
    Ok((shape[0], shape[1], data.to_vec()))
}

fn read_array1<T: Copy + Element>(
    array: PyReadonlyArray1<T>,
    expected: usize,
    name: &str,
) -> Result<Vec<T>, SimError> {
    let slice = array
        .as_slice()
        .map_err(|_| SimError::Shape(format!("{name} array must be contiguous")))?;
    if slice.len() != expected {
        return Err(SimError::Shape(format!(
            "{name} length {} does not match expected count {}",
            slice.len(),
            expected
        )));
    }
    Ok(slice.to_vec())
}

fn export_array<T: Copy + Element>(
    py: Python<'_>,
    data: &[T],
    dims: &[usize],
) -> PyResult<Py<PyAny>> {
    let array = unsafe { PyArrayDyn::<T>::new(py, IxDyn(dims), false) };
    unsafe {
        array
            .as_slice_mut()
            .map_err(|_| PyValueError::new_err("failed to export result tensor"))?
            .copy_from_slice(data);
    }
    Ok(array.into_any().unbind())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReactionTypeCode {
    MassAction = 0,
    Hill = 1,
    MichaelisMenten = 2,
    Expression = 3,
}

impl TryFrom<i32> for ReactionTypeCode {
    type Error = SimError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::MassAction),
            1 => Ok(Self::Hill),
            2 => Ok(Self::MichaelisMenten),
            3 => Ok(Self::Expression),
            other => Err(SimError::InvalidArgument(format!(
                "unsupported reaction type code {} (expected 0=mass-action, 1=Hill, 2=Michaelis-Menten, or 3=expression)",
                other
            ))),
        }
    }
}

fn rate_law_kind_from_code(
    code: ReactionTypeCode,
    reaction_idx: usize,
    n_species: usize,
    params: Option<&[f64]>,
    expression: Option<&str>,
) -> Result<RateLawKind, SimError> {
    match code {
        ReactionTypeCode::MassAction => Ok(RateLawKind::MassAction),
        ReactionTypeCode::Hill => {
            let params = params.ok_or_else(|| {
                SimError::InvalidArgument(format!(
                    "reaction {} requires Hill parameters",
                    reaction_idx
                ))
            })?;
            if params.len() < 3 {
                return Err(SimError::InvalidArgument(format!(
                    "reaction {} Hill parameters require [activator, hill_n, K]",
                    reaction_idx
                )));
            }
            let activator = params[0] as isize;
            let hill_n = params[1];
            let k_half = params[2];
            if activator < 0 || activator as usize >= n_species {
                return Err(SimError::InvalidArgument(format!(
                    "reaction {} activator index {} is out of range",
                    reaction_idx, params[0]
                )));
            }
            if hill_n <= 0.0 || k_half <= 0.0 {
                return Err(SimError::InvalidArgument(format!(
                    "reaction {} Hill parameters must be positive",
                    reaction_idx
                )));
            }
            Ok(RateLawKind::Hill {
                activator: activator as usize,
                hill_n,
                k_half,
                k_half_pow_n: k_half.powf(hill_n),
            })
        }
        ReactionTypeCode::MichaelisMenten => {
            let params = params.ok_or_else(|| {
                SimError::InvalidArgument(format!(
                    "reaction {} requires Michaelis-Menten parameters",
                    reaction_idx
                ))
            })?;
            if params.len() < 2 {
                return Err(SimError::InvalidArgument(format!(
                    "reaction {} Michaelis-Menten parameters require [substrate_index, k_m]",
                    reaction_idx
                )));
            }
            let substrate = params[0] as isize;
            let k_m = params[1];
            if substrate < 0 || substrate as usize >= n_species {
                return Err(SimError::InvalidArgument(format!(
                    "reaction {} substrate index {} is out of range",
                    reaction_idx, params[0]
                )));
            }
            if k_m <= 0.0 {
                return Err(SimError::InvalidArgument(format!(
                    "reaction {} Michaelis-Menten k_m must be positive",
                    reaction_idx
                )));
            }
            Ok(RateLawKind::MichaelisMenten {
                substrate: substrate as usize,
                k_m,
            })
        }
        ReactionTypeCode::Expression => {
            let expr_str = expression.ok_or_else(|| {
                SimError::InvalidArgument(format!(
                    "reaction {} requires an expression string",
                    reaction_idx
                ))
            })?;
            compile_rate_expression(expr_str, reaction_idx, n_species)
        }
    }
}

fn extract_param_rows(
    params: Option<PyReadonlyArray2<f64>>,
    n_reactions: usize,
) -> Result<Option<Vec<Vec<f64>>>, SimError> {
    params
        .map(|arr| {
            let (rows, width, flat) = flatten_pyarray2(arr, "reaction parameter array")?;
            if rows != n_reactions {
                return Err(SimError::Shape(format!(
                    "reaction parameter rows {} do not match reaction count {}",
                    rows, n_reactions
                )));
            }
            let mut out = Vec::with_capacity(rows);
            if width == 0 {
                out.resize_with(rows, Vec::new);
            } else {
                for chunk in flat.chunks(width) {
                    out.push(chunk.to_vec());
                }
            }
            Ok(out)
        })
        .transpose()
}

/// Assemble the model and rate laws from the flat numpy inputs.
#[allow(clippy::too_many_arguments)]
fn build_model(
    n_reactions: usize,
    n_species: usize,
    stoich: &[i64],
    initial_state: &[i64],
    rate_constants: &[f64],
    reaction_type_codes: &[i32],
    species_modes: Option<&[i32]>,
    switch_tol: Option<&[f64]>,
    switch_min: Option<&[i64]>,
    reaction_param_rows: Option<&[Vec<f64>]>,
    reaction_expressions: Option<&[Option<String>]>,
) -> Result<(Model, RateLawSet), SimError> {
    let mut species = Vec::with_capacity(n_species);
    for s in 0..n_species {
        if initial_state[s] < 0 {
            return Err(SimError::InvalidArgument(format!(
                "species {} has negative initial population {}",
                s, initial_state[s]
            )));
        }
        let mut spec = Species::new(s, format!("s{s}"), initial_state[s]);
        if let Some(modes) = species_modes {
            spec.user_mode = SpeciesMode::try_from(modes[s])?;
        }
        if let Some(tols) = switch_tol {
            spec.switch_tol = tols[s];
        }
        if let Some(mins) = switch_min {
            // Negative entries mean "not set".
            spec.switch_min = (mins[s] >= 0).then_some(mins[s]);
        }
        species.push(spec);
    }

    let mut reactions = Vec::with_capacity(n_reactions);
    let mut laws = Vec::with_capacity(n_reactions);
    for (idx, row) in stoich.chunks_exact(n_species).enumerate() {
        let code = ReactionTypeCode::try_from(reaction_type_codes[idx])?;
        let params = reaction_param_rows
            .and_then(|rows| rows.get(idx))
            .map(Vec::as_slice);
        let expression = reaction_expressions
            .and_then(|list| list.get(idx))
            .and_then(Option::as_deref);
        if code != ReactionTypeCode::Expression && expression.is_some() {
            return Err(SimError::InvalidArgument(format!(
                "reaction {} provided an expression but is not marked as expression-typed",
                idx
            )));
        }
        let kind = rate_law_kind_from_code(code, idx, n_species, params, expression)?;
        laws.push(RateLaw {
            rate_constant: rate_constants[idx],
            reactants: reactants_from_changes(row),
            kind,
        });
        reactions.push(Reaction::new(idx, format!("r{idx}"), row.to_vec()));
    }

    let laws = RateLawSet::new(laws);
    let mut model = Model::new(species, reactions)?;
    model.update_affected_reactions(&laws.reads())?;
    Ok((model, laws))
}

/// Hybrid tau-leaping ensemble solve.
///
/// Returns `(continuous, counts, modes, status)`:
/// - `continuous`: f64 `[trajectory][timestep][species]` integrated state,
/// - `counts`: i64 populations resolved through each species' partition,
/// - `modes`: i32 labels, 0=continuous / 1=discrete,
/// - `status`: i32 per trajectory (0=complete, 1=interrupted, 2=integrator
///   failure, 3=tau underflow). Failed trajectories keep partial results;
///   unwritten cells stay zero.
#[pyfunction(signature = (
    stoich,
    initial_state,
    rate_constants,
    reaction_type_codes,
    timeline,
    n_trajectories,
    species_modes=None,
    switch_tol=None,
    switch_min=None,
    reaction_type_params=None,
    reaction_expressions=None,
    tau_tol=None,
    rtol=None,
    atol=None,
    n_threads=None,
    seed=None
))]
#[allow(clippy::too_many_arguments)]
pub fn solve_tau_hybrid(
    py: Python<'_>,
    stoich: PyReadonlyArray2<i64>,
    initial_state: PyReadonlyArray1<i64>,
    rate_constants: PyReadonlyArray1<f64>,
    reaction_type_codes: PyReadonlyArray1<i32>,
    timeline: PyReadonlyArray1<f64>,
    n_trajectories: usize,
    species_modes: Option<PyReadonlyArray1<i32>>,
    switch_tol: Option<PyReadonlyArray1<f64>>,
    switch_min: Option<PyReadonlyArray1<i64>>,
    reaction_type_params: Option<PyReadonlyArray2<f64>>,
    reaction_expressions: Option<Vec<Option<String>>>,
    tau_tol: Option<f64>,
    rtol: Option<f64>,
    atol: Option<f64>,
    n_threads: Option<usize>,
    seed: Option<u64>,
) -> PyResult<(Py<PyAny>, Py<PyAny>, Py<PyAny>, Py<PyAny>)> {
    let (n_reactions, n_species, stoich_vec) = flatten_pyarray2(stoich, "stoichiometry matrix")?;
    if n_species == 0 {
        return Err(SimError::InvalidArgument(
            "stoichiometry must contain at least one species".into(),
        )
        .into());
    }
    let initial_vec = read_array1(initial_state, n_species, "initial state")?;
    let rate_vec = read_array1(rate_constants, n_reactions, "rate constant")?;
    let type_vec = read_array1(reaction_type_codes, n_reactions, "reaction type")?;
    let mode_vec = species_modes
        .map(|arr| read_array1(arr, n_species, "species mode"))
        .transpose()?;
    let tol_vec = switch_tol
        .map(|arr| read_array1(arr, n_species, "switch tolerance"))
        .transpose()?;
    let min_vec = switch_min
        .map(|arr| read_array1(arr, n_species, "switch minimum"))
        .transpose()?;
    let param_rows = extract_param_rows(reaction_type_params, n_reactions)?;
    if let Some(exprs) = &reaction_expressions {
        if exprs.len() != n_reactions {
            return Err(SimError::Shape(format!(
                "reaction_expressions length {} does not match reaction count {}",
                exprs.len(),
                n_reactions
            ))
            .into());
        }
    }

    let timeline_vec = timeline
        .as_slice()
        .map_err(|_| PyValueError::new_err("timeline array must be contiguous"))?
        .to_vec();

    let (model, laws) = build_model(
        n_reactions,
        n_species,
        &stoich_vec,
        &initial_vec,
        &rate_vec,
        &type_vec,
        mode_vec.as_deref(),
        tol_vec.as_deref(),
        min_vec.as_deref(),
        param_rows.as_deref(),
        reaction_expressions.as_deref(),
    )?;

    let mut options = SolveOptions::default();
    if let Some(tau_tol) = tau_tol {
        options.tau_tol = tau_tol;
    }
    if let Some(rtol) = rtol {
        options.rtol = rtol;
    }
    if let Some(atol) = atol {
        options.atol = atol;
    }
    options.seed = seed.unwrap_or(0);
    options.n_threads = n_threads;
    options.cancel = CancellationToken::global().clone();
    options.cancel.clear();

    let total = n_trajectories * timeline_vec.len() * n_species;
    let mut ode_out = vec![0.0f64; total];
    let mut counts_out = vec![0i64; total];
    let mut modes_out = vec![0i32; total];

    let report = py.detach(|| {
        tau_hybrid_solve(
            &model,
            &laws,
            &timeline_vec,
            n_trajectories,
            &options,
            &mut ode_out,
            &mut counts_out,
            &mut modes_out,
        )
    })?;

    let dims = [n_trajectories, timeline_vec.len(), n_species];
    let status_codes: Vec<i32> = report.statuses.iter().map(|&s| s as i32).collect();
    Ok((
        export_array(py, &ode_out, &dims)?,
        export_array(py, &counts_out, &dims)?,
        export_array(py, &modes_out, &dims)?,
        export_array(py, &status_codes, &[n_trajectories])?,
    ))
}

#[pymodule]
fn tauhybrid(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_function(wrap_pyfunction!(solve_tau_hybrid, module)?)?;
    module.add("CONTINUOUS", model::CONTINUOUS)?;
    module.add("DISCRETE", model::DISCRETE)?;
    module.add("DYNAMIC", model::DYNAMIC)?;
    module.add("SSA", SolverType::Ssa as i32)?;
    module.add("ODE", SolverType::Ode as i32)?;
    module.add("TAU", SolverType::Tau as i32)?;
    module.add("HYBRID", SolverType::Hybrid as i32)?;
    Ok(())
}

#[cfg(test)]
mod tests;
