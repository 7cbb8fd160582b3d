//! Result emission.
//!
//! Results live in three caller-owned flat buffers, each a stride-indexed
//! `[trajectory][timestep][species]` tensor:
//! continuous state (`f64`), discrete counts (`i64`), and partition labels
//! (`i32`, 0=continuous / 1=discrete). A [`TrajectoryWriter`] borrows one
//! trajectory's chunk of each buffer; every cell is written at most once.

use std::io::{self, Write};

use crate::model::PartitionMode;
use crate::state::HybridValue;

pub struct TrajectoryWriter<'a> {
    ode: &'a mut [f64],
    counts: &'a mut [i64],
    modes: &'a mut [i32],
    n_species: usize,
}

impl<'a> TrajectoryWriter<'a> {
    pub fn new(
        ode: &'a mut [f64],
        counts: &'a mut [i64],
        modes: &'a mut [i32],
        n_species: usize,
    ) -> Self {
        debug_assert_eq!(ode.len(), counts.len());
        debug_assert_eq!(ode.len(), modes.len());
        debug_assert_eq!(ode.len() % n_species, 0);
        Self {
            ode,
            counts,
            modes,
            n_species,
        }
    }

    pub fn n_steps(&self) -> usize {
        self.ode.len() / self.n_species
    }

    /// Write one timestep: the raw continuous state, the resolved per-species
    /// values, and the partition labels.
    pub fn emit(
        &mut self,
        step: usize,
        concentrations: &[f64],
        values: &[HybridValue],
        partitions: &[PartitionMode],
    ) {
        let start = step * self.n_species;
        let end = start + self.n_species;
        debug_assert!(end <= self.ode.len());
        self.ode[start..end].copy_from_slice(&concentrations[..self.n_species]);
        for s in 0..self.n_species {
            self.counts[start + s] = values[s].count();
            self.modes[start + s] = partitions[s].label();
        }
    }
}

/// Text serialization of a result tensor: one row per timestep,
/// `t v_1 v_2 ... v_N` separated by whitespace, trajectories separated by
/// a blank line.
pub fn write_results<W: Write>(
    out: &mut W,
    timeline: &[f64],
    values: &[f64],
    n_trajectories: usize,
    n_species: usize,
) -> io::Result<()> {
    let n_steps = timeline.len();
    debug_assert_eq!(values.len(), n_trajectories * n_steps * n_species);
    for traj in 0..n_trajectories {
        if traj > 0 {
            writeln!(out)?;
        }
        for (step, &t) in timeline.iter().enumerate() {
            write!(out, "{}", t)?;
            let start = (traj * n_steps + step) * n_species;
            for s in 0..n_species {
                write!(out, " {}", values[start + s])?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}
