//! Stiff ODE integration for the hybrid solver.
//!
//! [`Bdf`] is a variable-order (1-5), variable-step backward differentiation
//! formula integrator. The implicit stage equations are solved by simplified
//! Newton iteration; each Newton linear system is solved matrix-free by an
//! unpreconditioned GMRES (SPGMR-style) with Jacobian-vector products formed
//! from forward differences of the RHS.
//!
//! The driver owns one integrator per trajectory:
//! - [`Bdf::new`] binds the system and the initial state,
//! - [`Bdf::advance`] steps to an exact target time,
//! - [`Bdf::reset`] reinitializes after a rejected tau step,
//! - solver memory is released on drop.

use log::debug;
use thiserror::Error;

/// Right-hand side of an ODE system `dy/dt = f(t, y)`.
pub trait OdeSystem {
    /// Number of state variables.
    fn ndim(&self) -> usize;

    /// Evaluate `f(t, y)` and write into `dydt`. Both slices have length
    /// `ndim()`.
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);
}

/// Configuration for the BDF integrator.
#[derive(Debug, Clone)]
pub struct OdeOptions {
    /// Relative tolerance (default: 1e-5).
    pub rtol: f64,
    /// Absolute tolerance (default: 1e-12).
    pub atol: f64,
    /// Minimum internal step size (default: 1e-14).
    pub h_min: f64,
    /// Maximum internal step size (default: unbounded).
    pub h_max: f64,
    /// Maximum internal steps per `advance` call (default: 50_000).
    pub max_steps: usize,
    /// Highest BDF order to reach (default: 5).
    pub max_order: usize,
    /// Krylov subspace dimension for the linear solves (default: 5).
    pub krylov_dim: usize,
}

impl Default for OdeOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-12,
            h_min: 1e-14,
            h_max: f64::INFINITY,
            max_steps: 50_000,
            max_order: 5,
            krylov_dim: 5,
        }
    }
}

impl OdeOptions {
    fn validate(&self) -> Result<(), OdeError> {
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(OdeError::Setup("rtol must be finite and > 0".into()));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(OdeError::Setup("atol must be finite and > 0".into()));
        }
        if self.max_steps == 0 {
            return Err(OdeError::Setup("max_steps must be > 0".into()));
        }
        if self.max_order == 0 || self.max_order > MAX_BDF_ORDER {
            return Err(OdeError::Setup(format!(
                "max_order must be in 1..={MAX_BDF_ORDER}"
            )));
        }
        if self.krylov_dim == 0 {
            return Err(OdeError::Setup("krylov_dim must be > 0".into()));
        }
        Ok(())
    }

    fn initial_step(&self, span: f64) -> f64 {
        (span * 1e-3).max(self.h_min).min(self.h_max).min(span)
    }
}

#[derive(Debug, Error)]
pub enum OdeError {
    #[error("invalid integrator setup: {0}")]
    Setup(String),
    /// The solver cannot advance; the trajectory must be abandoned.
    #[error("integrator failure: {0}")]
    Fatal(String),
}

const MAX_BDF_ORDER: usize = 5;
const MAX_NEWTON: usize = 10;
const NEWTON_TOL: f64 = 0.01;
/// Relative residual reduction asked of the Krylov solve; Newton absorbs
/// the remaining inexactness.
const KRYLOV_TOL: f64 = 0.05;
const MAX_CONSECUTIVE_FAILURES: usize = 12;

/// Variable-order BDF integrator with matrix-free Newton-Krylov stages.
pub struct Bdf<'s, S: OdeSystem> {
    sys: &'s S,
    opts: OdeOptions,
    n: usize,
    t: f64,
    /// Accepted states, most recent first; `hist_y[0]` is the current state.
    hist_t: Vec<f64>,
    hist_y: Vec<Vec<f64>>,
    order: usize,
    /// Next step-size attempt; 0 requests a fresh heuristic on `advance`.
    h: f64,
}

impl<'s, S: OdeSystem> Bdf<'s, S> {
    pub fn new(sys: &'s S, y0: &[f64], t0: f64, opts: OdeOptions) -> Result<Self, OdeError> {
        opts.validate()?;
        let n = sys.ndim();
        if y0.len() != n {
            return Err(OdeError::Setup(format!(
                "y0.len()={} != ndim()={n}",
                y0.len()
            )));
        }
        if !t0.is_finite() {
            return Err(OdeError::Setup("t0 must be finite".into()));
        }
        Ok(Self {
            sys,
            opts,
            n,
            t: t0,
            hist_t: vec![t0],
            hist_y: vec![y0.to_vec()],
            order: 1,
            h: 0.0,
        })
    }

    #[inline]
    pub fn t(&self) -> f64 {
        self.t
    }

    /// Current state (the most recent accepted point).
    #[inline]
    pub fn y(&self) -> &[f64] {
        &self.hist_y[0]
    }

    /// Reinitialize at a given time and state, discarding all history.
    /// Used when the driver rolls back a rejected tau step.
    pub fn reset(&mut self, t: f64, y: &[f64]) {
        debug_assert_eq!(y.len(), self.n);
        self.t = t;
        self.hist_t.clear();
        self.hist_t.push(t);
        self.hist_y.truncate(1);
        self.hist_y[0].copy_from_slice(y);
        self.order = 1;
        self.h = 0.0;
    }

    /// Step to exactly `t_target`. Internal steps are clamped so the final
    /// one lands on the target; on return `self.y()` is the state at
    /// `t_target`.
    pub fn advance(&mut self, t_target: f64) -> Result<(), OdeError> {
        if !t_target.is_finite() || t_target < self.t {
            return Err(OdeError::Setup(format!(
                "advance target {t_target} precedes current time {}",
                self.t
            )));
        }
        let span = t_target - self.t;
        if span == 0.0 {
            return Ok(());
        }
        if self.h <= 0.0 {
            self.h = self.opts.initial_step(span);
        }

        let mut failures = 0usize;
        for _step in 0..self.opts.max_steps {
            if self.t >= t_target {
                return Ok(());
            }
            let h = self
                .h
                .min(t_target - self.t)
                .max(self.opts.h_min)
                .min(self.opts.h_max);

            match self.try_step(h) {
                StepOutcome::Accepted { err_norm } => {
                    failures = 0;
                    if self.t + self.opts.h_min >= t_target {
                        // Final step was clamped onto the target.
                        self.t = t_target;
                        self.hist_t[0] = t_target;
                    }
                    if self.order < self.opts.max_order && self.hist_t.len() > self.order {
                        self.order += 1;
                    }
                    let k = self.order as f64;
                    let factor = if err_norm == 0.0 {
                        4.0
                    } else {
                        (0.9 * err_norm.powf(-1.0 / (k + 1.0))).clamp(0.25, 4.0)
                    };
                    self.h = (h * factor).max(self.opts.h_min).min(self.opts.h_max);
                }
                StepOutcome::ErrorRejected { err_norm } => {
                    failures += 1;
                    let k = self.order as f64;
                    let factor = (0.9 * err_norm.powf(-1.0 / (k + 1.0))).clamp(0.1, 0.9);
                    self.h = (h * factor).max(self.opts.h_min);
                    if self.order > 1 {
                        self.order -= 1;
                    }
                }
                StepOutcome::NewtonFailed => {
                    failures += 1;
                    self.h = (h * 0.5).max(self.opts.h_min);
                    self.order = 1;
                    debug!("bdf: newton failure at t={:.6e}, halving to h={:.3e}", self.t, self.h);
                }
            }

            if failures > 0 && h <= self.opts.h_min {
                return Err(OdeError::Fatal(format!(
                    "step size underflow at t={:.6e}",
                    self.t
                )));
            }
            if failures >= MAX_CONSECUTIVE_FAILURES {
                return Err(OdeError::Fatal(format!(
                    "repeated convergence failure at t={:.6e}",
                    self.t
                )));
            }
        }
        Err(OdeError::Fatal(format!(
            "exceeded max_steps={} at t={:.6e} before reaching {:.6e}",
            self.opts.max_steps, self.t, t_target
        )))
    }

    /// Attempt a single BDF step of size `h` at the current order.
    fn try_step(&mut self, h: f64) -> StepOutcome {
        let n = self.n;
        let k = self.order.min(self.hist_t.len());
        let t_new = self.t + h;
        // A step below the resolution of the time axis would collapse the
        // interpolation nodes.
        if t_new <= self.t {
            return StepOutcome::NewtonFailed;
        }

        // Interpolation nodes: the unknown point followed by k history points.
        let mut nodes = Vec::with_capacity(k + 1);
        nodes.push(t_new);
        nodes.extend_from_slice(&self.hist_t[..k]);

        // BDF coefficients: y'(t_new) ~ sum_j alpha[j] * y(nodes[j]).
        let alpha = lagrange_deriv_at_first(&nodes);

        // Constant part of the stage equation from history.
        let mut c = vec![0.0; n];
        for j in 1..=k {
            let yj = &self.hist_y[j - 1];
            for i in 0..n {
                c[i] += alpha[j] * yj[i];
            }
        }

        // Predictor: extrapolate the history polynomial to t_new.
        let pred_w = lagrange_coeffs(&self.hist_t[..k], t_new);
        let mut y_pred = vec![0.0; n];
        for j in 0..k {
            let yj = &self.hist_y[j];
            for i in 0..n {
                y_pred[i] += pred_w[j] * yj[i];
            }
        }

        // Newton iteration on F(y) = alpha0*y + c - f(t_new, y) = 0.
        let alpha0 = alpha[0];
        let y_base = &self.hist_y[0];
        let mut y = y_pred.clone();
        let mut f_val = vec![0.0; n];
        let mut residual = vec![0.0; n];
        let mut delta = vec![0.0; n];
        let mut converged = false;

        for _nit in 0..MAX_NEWTON {
            self.sys.rhs(t_new, &y, &mut f_val);
            if f_val.iter().any(|v| !v.is_finite()) {
                return StepOutcome::NewtonFailed;
            }
            for i in 0..n {
                residual[i] = f_val[i] - alpha0 * y[i] - c[i];
            }

            // Solve (alpha0*I - J) delta = residual, matrix-free.
            let sys = self.sys;
            let y_norm = norm2(&y);
            let mut jv = vec![0.0; n];
            let mut y_shift = vec![0.0; n];
            let mut matvec = |v: &[f64], out: &mut [f64]| {
                let v_norm = norm2(v);
                if v_norm == 0.0 {
                    out.fill(0.0);
                    return;
                }
                let sigma = f64::EPSILON.sqrt() * (1.0 + y_norm) / v_norm;
                for i in 0..n {
                    y_shift[i] = y[i] + sigma * v[i];
                }
                sys.rhs(t_new, &y_shift, &mut jv);
                for i in 0..n {
                    out[i] = alpha0 * v[i] - (jv[i] - f_val[i]) / sigma;
                }
            };
            if !spgmr(&mut matvec, &residual, &mut delta, self.opts.krylov_dim, KRYLOV_TOL) {
                return StepOutcome::NewtonFailed;
            }

            let mut cnorm = 0.0;
            for i in 0..n {
                y[i] += delta[i];
                let sc = self.opts.atol + self.opts.rtol * y[i].abs().max(y_base[i].abs());
                cnorm += (delta[i] / sc) * (delta[i] / sc);
            }
            cnorm = (cnorm / n as f64).sqrt();
            if cnorm < NEWTON_TOL {
                converged = true;
                break;
            }
        }
        if !converged || y.iter().any(|v| !v.is_finite()) {
            return StepOutcome::NewtonFailed;
        }

        // Local error estimate from the predictor-corrector difference.
        let mut err_norm = 0.0;
        for i in 0..n {
            let ei = (y[i] - y_pred[i]) / (k as f64 + 1.0);
            let sc = self.opts.atol + self.opts.rtol * y[i].abs().max(y_base[i].abs());
            err_norm += (ei / sc) * (ei / sc);
        }
        err_norm = (err_norm / n as f64).sqrt();

        if err_norm > 1.0 {
            return StepOutcome::ErrorRejected { err_norm };
        }

        // Accept: push the new point onto the history front.
        self.t = t_new;
        self.hist_t.insert(0, t_new);
        self.hist_y.insert(0, y);
        let keep = self.opts.max_order;
        if self.hist_t.len() > keep {
            self.hist_t.truncate(keep);
            self.hist_y.truncate(keep);
        }
        StepOutcome::Accepted { err_norm }
    }
}

enum StepOutcome {
    Accepted { err_norm: f64 },
    ErrorRejected { err_norm: f64 },
    NewtonFailed,
}

#[inline]
fn norm2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

// ---------------------------------------------------------------------------
// Lagrange interpolation weights
// ---------------------------------------------------------------------------

/// Weights `l_j(tq)` of the Lagrange basis over `nodes`, evaluated at `tq`.
fn lagrange_coeffs(nodes: &[f64], tq: f64) -> Vec<f64> {
    let k = nodes.len();
    let mut w = vec![0.0; k];
    for j in 0..k {
        let mut lj = 1.0;
        for m in 0..k {
            if m != j {
                lj *= (tq - nodes[m]) / (nodes[j] - nodes[m]);
            }
        }
        w[j] = lj;
    }
    w
}

/// Derivatives `l_j'(x0)` of the Lagrange basis over `nodes` at the first
/// node. These are the BDF coefficients for a derivative approximation at
/// `nodes[0]` from the values at all nodes.
fn lagrange_deriv_at_first(nodes: &[f64]) -> Vec<f64> {
    let k = nodes.len();
    let x0 = nodes[0];
    let mut alpha = vec![0.0; k];
    for m in 1..k {
        alpha[0] += 1.0 / (x0 - nodes[m]);
    }
    for j in 1..k {
        let mut prod = 1.0;
        for m in 0..k {
            if m != j && m != 0 {
                prod *= (x0 - nodes[m]) / (nodes[j] - nodes[m]);
            }
        }
        alpha[j] = prod / (nodes[j] - x0);
    }
    alpha
}

// ---------------------------------------------------------------------------
// SPGMR: unpreconditioned GMRES over a matrix-free operator
// ---------------------------------------------------------------------------

/// Solve `A x = b` by GMRES with at most `m` Krylov vectors, no restarts,
/// no preconditioning. `x` receives the best subspace solution found;
/// returns false only when the operator produced non-finite values.
///
/// The Newton loop tolerates an inexact solve, so hitting the subspace cap
/// before the residual target is not a failure.
fn spgmr(
    matvec: &mut dyn FnMut(&[f64], &mut [f64]),
    b: &[f64],
    x: &mut [f64],
    m: usize,
    rel_tol: f64,
) -> bool {
    let n = b.len();
    x.fill(0.0);
    let beta = norm2(b);
    if beta == 0.0 {
        return true;
    }
    let m = m.min(n).max(1);

    // Krylov basis, row-major (m+1 vectors of length n).
    let mut v = vec![0.0; (m + 1) * n];
    // Hessenberg column scratch and triangularized diagonal entries.
    let mut hcol = vec![0.0; m + 1];
    let mut r_diag = vec![0.0; m * m];
    // Givens rotations and the rotated residual vector.
    let mut cs = vec![0.0; m];
    let mut sn = vec![0.0; m];
    let mut g = vec![0.0; m + 1];
    g[0] = beta;

    for i in 0..n {
        v[i] = b[i] / beta;
    }

    let mut w = vec![0.0; n];
    let mut cols = 0usize;
    for j in 0..m {
        matvec(&v[j * n..(j + 1) * n], &mut w);
        if w.iter().any(|c| !c.is_finite()) {
            return false;
        }

        // Modified Gram-Schmidt against the existing basis.
        for i in 0..=j {
            let vi = &v[i * n..(i + 1) * n];
            let mut dot = 0.0;
            for l in 0..n {
                dot += w[l] * vi[l];
            }
            hcol[i] = dot;
            for l in 0..n {
                w[l] -= dot * vi[l];
            }
        }
        let h_next = norm2(&w);
        hcol[j + 1] = h_next;

        // Apply the accumulated rotations to the new column.
        for i in 0..j {
            let tmp = cs[i] * hcol[i] + sn[i] * hcol[i + 1];
            hcol[i + 1] = -sn[i] * hcol[i] + cs[i] * hcol[i + 1];
            hcol[i] = tmp;
        }
        let denom = (hcol[j] * hcol[j] + hcol[j + 1] * hcol[j + 1]).sqrt();
        if denom == 0.0 {
            cols = j;
            break;
        }
        cs[j] = hcol[j] / denom;
        sn[j] = hcol[j + 1] / denom;
        hcol[j] = denom;
        g[j + 1] = -sn[j] * g[j];
        g[j] *= cs[j];

        for i in 0..=j {
            r_diag[i * m + j] = hcol[i];
        }
        cols = j + 1;

        if g[j + 1].abs() <= rel_tol * beta || h_next == 0.0 {
            break;
        }
        if cols < m {
            let vn = &mut v[(j + 1) * n..(j + 2) * n];
            for l in 0..n {
                vn[l] = w[l] / h_next;
            }
        }
    }

    // No usable Krylov direction: the iteration matrix annihilated the
    // residual direction. Let the Newton loop treat it as a failure.
    if cols == 0 {
        return false;
    }

    // Back-substitute the triangular least-squares system.
    let mut yk = vec![0.0; cols];
    for i in (0..cols).rev() {
        let mut s = g[i];
        for l in (i + 1)..cols {
            s -= r_diag[i * m + l] * yk[l];
        }
        yk[i] = s / r_diag[i * m + i];
    }
    for j in 0..cols {
        let vj = &v[j * n..(j + 1) * n];
        for l in 0..n {
            x[l] += yk[j] * vj[l];
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// dy/dt = -k*y
    struct ExpDecay {
        k: f64,
    }
    impl OdeSystem for ExpDecay {
        fn ndim(&self) -> usize {
            1
        }
        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -self.k * y[0];
        }
    }

    /// Classic stiff pair: fast transient onto a slow manifold.
    struct StiffPair;
    impl OdeSystem for StiffPair {
        fn ndim(&self) -> usize {
            2
        }
        fn rhs(&self, _t: f64, y: &[f64], dydt: &mut [f64]) {
            dydt[0] = -1000.0 * y[0] + y[1];
            dydt[1] = -0.5 * y[1];
        }
    }

    #[test]
    fn bdf_exp_decay_matches_analytic() {
        let sys = ExpDecay { k: 1.3 };
        let mut bdf = Bdf::new(&sys, &[2.0], 0.0, OdeOptions::default()).unwrap();
        bdf.advance(1.0).unwrap();
        let expected = 2.0 * (-1.3_f64).exp();
        assert!(
            (bdf.y()[0] - expected).abs() < 1e-4,
            "got {}, expected {expected}",
            bdf.y()[0]
        );
        assert_eq!(bdf.t(), 1.0);
    }

    #[test]
    fn bdf_advances_in_segments() {
        let sys = ExpDecay { k: 0.7 };
        let mut bdf = Bdf::new(&sys, &[1.0], 0.0, OdeOptions::default()).unwrap();
        for step in 1..=10 {
            bdf.advance(step as f64 * 0.1).unwrap();
        }
        let expected = (-0.7_f64).exp();
        assert!(
            (bdf.y()[0] - expected).abs() < 1e-4,
            "segmented advance drifted: {} vs {expected}",
            bdf.y()[0]
        );
    }

    #[test]
    fn bdf_handles_stiff_system() {
        let mut y0 = [1.0, 1.0];
        let sys = StiffPair;
        let mut bdf = Bdf::new(&sys, &y0, 0.0, OdeOptions::default()).unwrap();
        bdf.advance(10.0).unwrap();
        // Fast component collapses to y1/1000 scale; slow component decays.
        let slow = (-0.5_f64 * 10.0).exp();
        assert!((bdf.y()[1] - slow).abs() < 1e-3);
        assert!(bdf.y()[0].abs() < 1e-2);
        // Reset restarts cleanly from an arbitrary state.
        y0 = [0.5, 0.5];
        bdf.reset(0.0, &y0);
        bdf.advance(1.0).unwrap();
        assert!((bdf.y()[1] - 0.5 * (-0.5_f64).exp()).abs() < 1e-3);
    }

    #[test]
    fn bdf_zero_span_is_noop() {
        let sys = ExpDecay { k: 1.0 };
        let mut bdf = Bdf::new(&sys, &[1.0], 0.0, OdeOptions::default()).unwrap();
        bdf.advance(0.0).unwrap();
        assert_eq!(bdf.y()[0], 1.0);
    }

    #[test]
    fn bdf_rejects_dimension_mismatch() {
        let sys = ExpDecay { k: 1.0 };
        assert!(Bdf::new(&sys, &[1.0, 2.0], 0.0, OdeOptions::default()).is_err());
    }

    #[test]
    fn bdf_rejects_backward_target() {
        let sys = ExpDecay { k: 1.0 };
        let mut bdf = Bdf::new(&sys, &[1.0], 1.0, OdeOptions::default()).unwrap();
        assert!(bdf.advance(0.5).is_err());
    }

    #[test]
    fn lagrange_derivative_recovers_backward_euler() {
        // Nodes [t+h, t] give alpha = [1/h, -1/h].
        let alpha = lagrange_deriv_at_first(&[1.0, 0.0]);
        assert!((alpha[0] - 1.0).abs() < 1e-12);
        assert!((alpha[1] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn lagrange_derivative_recovers_bdf2() {
        // Uniform nodes [2h, h, 0] with h=1: alpha = [3/2, -2, 1/2].
        let alpha = lagrange_deriv_at_first(&[2.0, 1.0, 0.0]);
        assert!((alpha[0] - 1.5).abs() < 1e-12);
        assert!((alpha[1] + 2.0).abs() < 1e-12);
        assert!((alpha[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn spgmr_solves_diagonal_system() {
        let mut matvec = |v: &[f64], out: &mut [f64]| {
            out[0] = 2.0 * v[0];
            out[1] = 4.0 * v[1];
        };
        let b = [2.0, 8.0];
        let mut x = [0.0, 0.0];
        assert!(spgmr(&mut matvec, &b, &mut x, 5, 1e-10));
        assert!((x[0] - 1.0).abs() < 1e-8);
        assert!((x[1] - 2.0).abs() < 1e-8);
    }

    #[test]
    fn spgmr_zero_rhs_gives_zero() {
        let mut matvec = |v: &[f64], out: &mut [f64]| out.copy_from_slice(v);
        let b = [0.0, 0.0, 0.0];
        let mut x = [1.0, 1.0, 1.0];
        assert!(spgmr(&mut matvec, &b, &mut x, 3, 1e-10));
        assert_eq!(x, [0.0, 0.0, 0.0]);
    }
}
