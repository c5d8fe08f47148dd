//! A gradient-based optimization driver for expensive objective functions.
//!
//! This crate provides a local, single-objective minimizer designed for problems
//! where each objective evaluation is costly (for example, a CFD solve inside an
//! aerodynamic design loop). The driver treats the objective as an opaque callback
//! and spends its effort on keeping the number of evaluations small.
//!
//! # Features
//! - Dense BFGS direction engine with a mandatory curvature guard (`s·y > ε`),
//!   SPD validation of every inverse-Hessian update, and an explicit
//!   degraded-to-steepest-descent state for recovery after bad steps.
//! - Backtracking Armijo line search with safeguarded quadratic interpolation,
//!   warm-started step lengths, and an optional strong-Wolfe curvature check
//!   when analytic gradients make trial-point gradients free.
//! - Gradient estimation by analytic pass-through, forward differences, or
//!   central differences, with detection of wildly disagreeing displaced
//!   evaluations on noisy models.
//! - Variable scaling so heterogeneous design variables are optimized in
//!   comparable magnitudes, with gradients mapped back by the chain rule.
//! - Box bounds (projection + active-set aware directions) and linear
//!   inequality rows handled through a feasible-step ratio test.
//! - Evaluation caching, evaluation averaging for noisy objectives, a full
//!   per-iteration history, cancellation between iterations, and structured
//!   termination reasons instead of opaque failures.
//!
//! ## Defaults (key settings)
//! - Gradient mode: central differences with `step_scale = 1e-6`.
//! - Tolerances: `g_tol = 1e-6` (projected gradient infinity-norm),
//!   `f_tol = 1e-12` relative decrease over 3 consecutive iterations.
//! - Line search: `c1 = 1e-4`, 20 trials, step growth 2.0, no curvature check.
//! - Iteration budget: 500.
//!
//! # Example
//!
//! Minimize a shifted paraboloid with analytic gradients.
//!
//! ```
//! use gradopt::{Driver, EvalFailure, Evaluation, Termination};
//! use ndarray::{array, Array1};
//!
//! let paraboloid = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
//!     let f = (x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2);
//!     let g = array![2.0 * (x[0] - 3.0), 2.0 * (x[1] + 1.0)];
//!     Ok(Evaluation::with_gradient(f, g))
//! };
//!
//! let result = Driver::new(array![0.0, 0.0], paraboloid)
//!     .with_analytic_gradients()
//!     .with_gradient_tolerance(1e-8)
//!     .run()
//!     .expect("configuration is valid");
//!
//! assert_eq!(result.termination, Termination::Converged);
//! assert!((result.final_point[0] - 3.0).abs() < 1e-6);
//! assert!((result.final_point[1] + 1.0).abs() < 1e-6);
//! ```

use ndarray::{Array1, Array2};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// Numerical constants shared across the driver.
const CURVATURE_FLOOR: f64 = 1e-10;
const MIN_STEP: f64 = 1e-12;
const MAX_WARM_STEP: f64 = 1e3;

#[inline]
fn inf_norm(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

#[inline]
fn active_tol(bound: f64) -> f64 {
    1e-9 * (1.0 + bound.abs())
}

// Simple dense SPD Cholesky (LL^T). Returns None when the matrix is not
// positive-definite, which the direction engine treats as a failed update.
fn chol_decompose(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return None;
    }
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

fn scaled_identity(n: usize, lambda: f64) -> Array2<f64> {
    Array2::<f64>::eye(n) * lambda
}

/// One reply from the objective callback: a scalar value and, when the caller
/// computes them (adjoint solver, algorithmic differentiation), the gradient.
///
/// The gradient, when present, is expressed in the caller's physical variable
/// space; the driver applies the chain rule for its internal scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Objective value at the queried point.
    pub value: f64,
    /// Gradient at the queried point, length `n`, if the caller supplies one.
    pub gradient: Option<Array1<f64>>,
}

impl Evaluation {
    /// An evaluation carrying only the objective value.
    pub fn new(value: f64) -> Self {
        Self {
            value,
            gradient: None,
        }
    }

    /// An evaluation carrying the objective value and its analytic gradient.
    pub fn with_gradient(value: f64, gradient: Array1<f64>) -> Self {
        Self {
            value,
            gradient: Some(gradient),
        }
    }
}

/// Explicit failure signal from the objective callback, e.g. the underlying
/// flow solver diverged at the queried design point.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct EvalFailure {
    reason: String,
}

impl EvalFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Why a single objective evaluation could not be used.
///
/// These are recoverable while a line search can still shrink its step; the
/// driver only surfaces one inside [`Termination::Aborted`] when no shorter
/// step remains to try.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("objective callback reported failure: {0}")]
    Callback(#[from] EvalFailure),
    #[error("objective returned a non-finite value ({value})")]
    NonFinite { value: f64 },
    #[error("analytic gradient mode is configured but the callback returned no gradient")]
    MissingGradient,
    #[error("gradient length {found} does not match the problem dimension {expected}")]
    GradientDimension { expected: usize, found: usize },
}

/// Configuration problems detected before the first evaluation. These are the
/// only errors [`Driver::run`] returns as `Err`; everything after a valid
/// start is reported through [`Termination`] with the history intact.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the initial point has no variables")]
    EmptyStart,
    #[error("the initial point contains a non-finite value")]
    NonFiniteStart,
    #[error("{what} has length {found}, expected {expected}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("variable scale {index} is not a finite positive number")]
    InvalidScale { index: usize },
    #[error("lower bound exceeds upper bound for variable {index}")]
    InvertedBounds { index: usize },
    #[error("linear constraint row {row} is violated at the initial point")]
    InfeasibleStart { row: usize },
    #[error("{name} must be positive")]
    InvalidTolerance { name: &'static str },
    #[error("{name} is outside its valid range")]
    InvalidParameter { name: &'static str },
}

/// How a run ended. Conditions are checked in the order listed; the first
/// matching condition wins.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Projected gradient infinity-norm fell below `g_tol`.
    Converged,
    /// Relative objective decrease stayed below `f_tol` for the configured
    /// number of consecutive iterations.
    SlowProgress,
    /// The iteration budget was exhausted.
    MaxIterations,
    /// Two consecutive line searches failed; the last feasible point is
    /// reported.
    Stalled,
    /// The cancellation token was observed between iterations.
    Cancelled,
    /// An evaluation failure that no step shrinking could route around.
    Aborted(EvalError),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Converged => write!(f, "converged on gradient tolerance"),
            Termination::SlowProgress => write!(f, "converged on slow objective progress"),
            Termination::MaxIterations => write!(f, "iteration budget exhausted"),
            Termination::Stalled => write!(f, "stalled: repeated line search failures"),
            Termination::Cancelled => write!(f, "cancelled by caller"),
            Termination::Aborted(e) => write!(f, "aborted: {e}"),
        }
    }
}

/// Observable state of the direction engine, recorded per iteration so callers
/// (and tests) can follow fallback behavior directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No usable curvature information yet; direction is the negative gradient.
    SteepestDescent,
    /// BFGS inverse-Hessian direction.
    QuasiNewton,
    /// Recovering from a failed step or noisy gradient; direction is the
    /// negative gradient until the next successful curvature update.
    Degraded,
}

/// Snapshot of one driver iteration, appended to the history before any
/// termination check runs.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// 1-based iteration index.
    pub iteration: usize,
    /// Design point in the caller's physical space after this iteration.
    pub point: Array1<f64>,
    /// Objective value at `point`.
    pub value: f64,
    /// Infinity-norm of the projected gradient in scaled space. `NaN` when the
    /// gradient at an accepted point could not be estimated (aborted runs).
    pub gradient_norm: f64,
    /// Accepted step length, or 0.0 for a failed line search.
    pub step_length: f64,
    /// Engine state that produced the search direction for this iteration.
    pub engine_state: EngineState,
    /// Whether the iteration moved to a new point.
    pub accepted: bool,
}

/// Final outcome of an optimization run.
#[derive(Debug)]
pub struct RunResult {
    /// Best point reached, in the caller's physical space.
    pub final_point: Array1<f64>,
    /// Objective value at `final_point`. `NaN` if no evaluation succeeded.
    pub final_value: f64,
    /// Projected gradient infinity-norm at `final_point` (scaled space).
    pub final_gradient_norm: f64,
    /// Why the run ended.
    pub termination: Termination,
    /// Number of iterations executed (equals `history.len()`).
    pub iterations: usize,
    /// Total objective callback invocations, including finite-difference
    /// perturbations and averaging repeats.
    pub func_evals: usize,
    /// Total gradient estimates produced.
    pub grad_evals: usize,
    /// Complete ordered iteration trace, including failed iterations.
    pub history: Vec<IterationRecord>,
}

/// Cooperative cancellation flag, checked at the top of every iteration.
///
/// Cancelling mid-iteration lets the current iteration finish and record
/// itself; the history therefore always ends on a fully-recorded iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One linear inequality `coeffs · x <= upper` over the physical variables.
#[derive(Debug, Clone)]
pub struct LinearConstraint {
    pub coeffs: Array1<f64>,
    pub upper: f64,
}

impl LinearConstraint {
    pub fn new(coeffs: Array1<f64>, upper: f64) -> Self {
        Self { coeffs, upper }
    }
}

// Bounds and linear rows, pre-converted to scaled variable space.
struct Constraints {
    lower: Option<Array1<f64>>,
    upper: Option<Array1<f64>>,
    linear: Vec<LinearConstraint>,
}

impl Constraints {
    fn project(&self, z: &Array1<f64>) -> Array1<f64> {
        let mut out = z.clone();
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            for i in 0..out.len() {
                if out[i] < lower[i] {
                    out[i] = lower[i];
                } else if out[i] > upper[i] {
                    out[i] = upper[i];
                }
            }
        }
        out
    }

    // Zero the gradient components that point out of an active bound, so the
    // convergence test measures only feasible descent potential.
    fn projected_gradient(&self, z: &Array1<f64>, g: &Array1<f64>) -> Array1<f64> {
        let mut gp = g.clone();
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            for i in 0..gp.len() {
                let at_lower = z[i] <= lower[i] + active_tol(lower[i]);
                let at_upper = z[i] >= upper[i] - active_tol(upper[i]);
                if (at_lower && g[i] >= 0.0) || (at_upper && g[i] <= 0.0) {
                    gp[i] = 0.0;
                }
            }
        }
        gp
    }

    // Zero direction components that would immediately leave an active bound.
    fn zero_blocked(&self, z: &Array1<f64>, d: &mut Array1<f64>) {
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            for i in 0..d.len() {
                if d[i] < 0.0 && z[i] <= lower[i] + active_tol(lower[i]) {
                    d[i] = 0.0;
                }
                if d[i] > 0.0 && z[i] >= upper[i] - active_tol(upper[i]) {
                    d[i] = 0.0;
                }
            }
        }
    }

    // Ratio test: largest alpha >= 0 with z + alpha*d still feasible.
    fn max_feasible_step(&self, z: &Array1<f64>, d: &Array1<f64>) -> f64 {
        let mut alpha = f64::INFINITY;
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            for i in 0..d.len() {
                if d[i] > 0.0 && upper[i].is_finite() {
                    alpha = alpha.min((upper[i] - z[i]) / d[i]);
                } else if d[i] < 0.0 && lower[i].is_finite() {
                    alpha = alpha.min((lower[i] - z[i]) / d[i]);
                }
            }
        }
        for row in &self.linear {
            let rate = row.coeffs.dot(d);
            if rate > 1e-16 {
                alpha = alpha.min((row.upper - row.coeffs.dot(z)) / rate);
            }
        }
        alpha.max(0.0)
    }

    fn first_violated(&self, z: &Array1<f64>) -> Option<usize> {
        self.linear.iter().position(|row| {
            let slack = row.upper - row.coeffs.dot(z);
            slack < -active_tol(row.upper)
        })
    }
}

// Wraps the caller's callback: applies variable scaling, caches the last
// evaluation, optionally averages repeated calls, and counts invocations.
struct Adapter<ObjFn> {
    obj_fn: ObjFn,
    scales: Array1<f64>,
    averaging: usize,
    cache: Option<(Array1<f64>, Evaluation)>,
    func_evals: usize,
}

impl<ObjFn> Adapter<ObjFn>
where
    ObjFn: FnMut(&Array1<f64>) -> Result<Evaluation, EvalFailure>,
{
    fn new(obj_fn: ObjFn, scales: Array1<f64>, averaging: usize) -> Self {
        Self {
            obj_fn,
            scales,
            averaging,
            cache: None,
            func_evals: 0,
        }
    }

    /// Evaluate at a scaled-space point. The returned gradient, if any, is
    /// already converted to scaled space via the chain rule.
    fn evaluate(&mut self, z: &Array1<f64>) -> Result<Evaluation, EvalError> {
        if let Some((cached_z, cached)) = &self.cache {
            if cached_z == z {
                log::debug!("[adapter] cache hit, skipping re-evaluation");
                return Ok(cached.clone());
            }
        }

        let x = z * &self.scales;
        let n = z.len();
        let mut value_sum = 0.0;
        let mut gradient: Option<Array1<f64>> = None;
        for repeat in 0..self.averaging {
            self.func_evals += 1;
            let reply = (self.obj_fn)(&x)?;
            if !reply.value.is_finite() {
                return Err(EvalError::NonFinite { value: reply.value });
            }
            value_sum += reply.value;
            if repeat == 0 {
                if let Some(g_phys) = reply.gradient {
                    if g_phys.len() != n {
                        return Err(EvalError::GradientDimension {
                            expected: n,
                            found: g_phys.len(),
                        });
                    }
                    if g_phys.iter().any(|v| !v.is_finite()) {
                        return Err(EvalError::NonFinite { value: f64::NAN });
                    }
                    // d f / d z_i = (d f / d x_i) * scale_i
                    gradient = Some(&g_phys * &self.scales);
                }
            }
        }

        let evaluation = Evaluation {
            value: value_sum / self.averaging as f64,
            gradient,
        };
        self.cache = Some((z.clone(), evaluation.clone()));
        Ok(evaluation)
    }
}

// Gradient source, fixed at configuration time.
#[derive(Debug, Clone, Copy)]
enum GradientMode {
    Analytic,
    Forward { step_scale: f64 },
    Central { step_scale: f64 },
}

enum GradError {
    Eval(EvalError),
    /// The displaced evaluations of one component disagreed beyond the noise
    /// threshold. The assembled estimate is still returned so the driver can
    /// fall back to an untrusted steepest-descent step.
    Noisy {
        gradient: Array1<f64>,
        component: usize,
    },
}

struct GradientEstimator {
    mode: GradientMode,
    noise_threshold: f64,
}

impl GradientEstimator {
    fn gradient<ObjFn>(
        &self,
        adapter: &mut Adapter<ObjFn>,
        z: &Array1<f64>,
        at: &Evaluation,
    ) -> Result<Array1<f64>, GradError>
    where
        ObjFn: FnMut(&Array1<f64>) -> Result<Evaluation, EvalFailure>,
    {
        match self.mode {
            GradientMode::Analytic => at
                .gradient
                .clone()
                .ok_or(GradError::Eval(EvalError::MissingGradient)),
            GradientMode::Forward { step_scale } => {
                let n = z.len();
                let f0 = at.value;
                let mut g = Array1::<f64>::zeros(n);
                for i in 0..n {
                    let h = step_scale * z[i].abs().max(1.0);
                    let mut z_plus = z.clone();
                    z_plus[i] += h;
                    let f_plus = adapter.evaluate(&z_plus).map_err(GradError::Eval)?.value;
                    g[i] = (f_plus - f0) / h;
                }
                Ok(g)
            }
            GradientMode::Central { step_scale } => {
                let n = z.len();
                let f0 = at.value;
                let mut g = Array1::<f64>::zeros(n);
                let mut noisy_component = None;
                for i in 0..n {
                    let h = step_scale * z[i].abs().max(1.0);
                    let mut z_plus = z.clone();
                    z_plus[i] += h;
                    let mut z_minus = z.clone();
                    z_minus[i] -= h;
                    let f_plus = adapter.evaluate(&z_plus).map_err(GradError::Eval)?.value;
                    let f_minus = adapter.evaluate(&z_minus).map_err(GradError::Eval)?.value;
                    let spread = (f_plus - f_minus).abs();
                    if !spread.is_finite() || spread > self.noise_threshold * (1.0 + f0.abs()) {
                        noisy_component.get_or_insert(i);
                    }
                    g[i] = (f_plus - f_minus) / (2.0 * h);
                }
                match noisy_component {
                    Some(component) => Err(GradError::Noisy {
                        gradient: g,
                        component,
                    }),
                    None => Ok(g),
                }
            }
        }
    }
}

// BFGS inverse-Hessian state machine. Owns the approximation exclusively; the
// driver reports line-search and gradient trouble through `degrade`.
struct DirectionEngine {
    state: EngineState,
    h_inv: Array2<f64>,
    hessian_init: f64,
    condition_ceiling: f64,
}

impl DirectionEngine {
    fn new(n: usize, hessian_init: f64, condition_ceiling: f64) -> Self {
        Self {
            state: EngineState::SteepestDescent,
            h_inv: scaled_identity(n, hessian_init),
            hessian_init,
            condition_ceiling,
        }
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn direction(&self, g: &Array1<f64>) -> Array1<f64> {
        match self.state {
            EngineState::QuasiNewton => -self.h_inv.dot(g),
            EngineState::SteepestDescent | EngineState::Degraded => -g.clone(),
        }
    }

    /// Reset the approximation and fall back to steepest descent until the
    /// next successful curvature update.
    fn degrade(&mut self) {
        let n = self.h_inv.nrows();
        self.h_inv = scaled_identity(n, self.hessian_init);
        self.state = EngineState::Degraded;
        log::debug!("[engine] degraded: inverse Hessian reset to scaled identity");
    }

    /// Apply the BFGS update for step `s` and gradient change `y`. The update
    /// is skipped outright when the curvature `s·y` is not safely positive;
    /// forcing it would destroy positive-definiteness.
    fn update(&mut self, s: &Array1<f64>, y: &Array1<f64>) {
        let sy = s.dot(y);
        let s_norm = s.dot(s).sqrt();
        let y_norm = y.dot(y).sqrt();
        if !sy.is_finite() || sy <= CURVATURE_FLOOR * s_norm * y_norm {
            log::debug!("[engine] curvature update skipped (s·y = {sy:.3e})");
            return;
        }

        let n = self.h_inv.nrows();
        let rho = 1.0 / sy;
        let hy = self.h_inv.dot(y);
        let yhy = y.dot(&hy);
        // H' = H + ρ((1 + ρ yᵀHy) s sᵀ − Hy sᵀ − s (Hy)ᵀ)
        let mut candidate = self.h_inv.clone();
        for i in 0..n {
            for j in 0..n {
                candidate[[i, j]] +=
                    rho * ((1.0 + rho * yhy) * s[i] * s[j] - hy[i] * s[j] - s[i] * hy[j]);
            }
        }
        // Enforce exact symmetry against accumulated rounding.
        for i in 0..n {
            for j in (i + 1)..n {
                let v = 0.5 * (candidate[[i, j]] + candidate[[j, i]]);
                candidate[[i, j]] = v;
                candidate[[j, i]] = v;
            }
        }

        if candidate.iter().any(|v| !v.is_finite()) {
            log::warn!("[engine] update produced non-finite entries, degrading");
            self.degrade();
            return;
        }
        let mut diag_min = f64::INFINITY;
        let mut diag_max = 0.0_f64;
        for i in 0..n {
            diag_min = diag_min.min(candidate[[i, i]]);
            diag_max = diag_max.max(candidate[[i, i]]);
        }
        if diag_min <= 0.0 || diag_max / diag_min > self.condition_ceiling {
            log::warn!(
                "[engine] condition estimate {:.3e} above ceiling, degrading",
                diag_max / diag_min
            );
            self.degrade();
            return;
        }
        if chol_decompose(&candidate).is_none() {
            log::warn!("[engine] update lost positive-definiteness, degrading");
            self.degrade();
            return;
        }

        self.h_inv = candidate;
        self.state = EngineState::QuasiNewton;
    }
}

#[derive(Debug)]
enum LineSearchError {
    /// `g·d >= 0`: the direction cannot decrease the objective.
    NotDescent,
    /// Trial budget spent, or the feasible step collapsed to zero.
    Exhausted,
    /// An evaluation kept failing down to the minimum step length.
    FatalEval(EvalError),
}

type LineSearchOk = (f64, Array1<f64>, Evaluation);

/// Backtracking Armijo search along `d` from `z0`, capped to the feasible
/// region. Rejected trials pick the next step by safeguarded quadratic
/// interpolation of the 1-D restriction; evaluation failures shrink the step
/// like a rejection and only become fatal at the minimum step length.
#[allow(clippy::too_many_arguments)]
fn line_search<ObjFn>(
    core: &DriverCore,
    adapter: &mut Adapter<ObjFn>,
    constraints: &Constraints,
    z0: &Array1<f64>,
    f0: f64,
    g0: &Array1<f64>,
    d: &Array1<f64>,
    alpha_init: f64,
) -> Result<LineSearchOk, LineSearchError>
where
    ObjFn: FnMut(&Array1<f64>) -> Result<Evaluation, EvalFailure>,
{
    let slope = g0.dot(d);
    if !slope.is_finite() || slope >= 0.0 {
        log::warn!("[line-search] not a descent direction (g·d = {slope:.3e})");
        return Err(LineSearchError::NotDescent);
    }

    let alpha_cap = constraints.max_feasible_step(z0, d);
    let mut alpha = alpha_init.min(alpha_cap);
    if alpha <= 0.0 {
        log::warn!("[line-search] no feasible step along the search direction");
        return Err(LineSearchError::Exhausted);
    }

    // Curvature checking is only worthwhile when gradients at trial points are
    // free, i.e. the callback computes them analytically.
    let curvature_c2 = match core.gradient_mode {
        GradientMode::Analytic => core.curvature_c2,
        _ => None,
    };
    let mut armijo_fallback: Option<LineSearchOk> = None;

    for _ in 0..core.max_trials {
        let z_trial = constraints.project(&(z0 + &(d * alpha)));
        match adapter.evaluate(&z_trial) {
            Err(e) => {
                // Infeasible point as far as the model is concerned: shrink.
                if alpha <= MIN_STEP {
                    log::warn!("[line-search] evaluation failed at the minimum step: {e}");
                    return Err(LineSearchError::FatalEval(e));
                }
                log::debug!("[line-search] evaluation failed at α = {alpha:.3e}, shrinking");
                alpha *= 0.5;
            }
            Ok(trial) => {
                if trial.value <= f0 + core.c1 * alpha * slope {
                    if let (Some(c2), Some(g_trial)) = (curvature_c2, trial.gradient.as_ref()) {
                        let dphi = g_trial.dot(d);
                        // Armijo holds but curvature does not. A still-negative
                        // slope means the step is too short: grow and retry
                        // while the budget lasts, keeping this point as a
                        // fallback.
                        if dphi.abs() > c2 * slope.abs() && dphi < 0.0 && alpha < alpha_cap {
                            let grown = (alpha * 2.0).min(alpha_cap);
                            armijo_fallback = Some((alpha, z_trial, trial));
                            alpha = grown;
                            continue;
                        }
                    }
                    return Ok((alpha, z_trial, trial));
                }

                // Quadratic interpolation through φ(0), φ'(0), φ(α), clamped
                // to keep the shrink factor in [0.1, 0.5].
                let denom = 2.0 * (trial.value - f0 - slope * alpha);
                let alpha_q = if denom > 0.0 {
                    -slope * alpha * alpha / denom
                } else {
                    0.5 * alpha
                };
                alpha = alpha_q.clamp(0.1 * alpha, 0.5 * alpha);
                if alpha < MIN_STEP {
                    break;
                }
            }
        }
    }

    if let Some(fallback) = armijo_fallback {
        log::debug!("[line-search] curvature check unsatisfied, keeping Armijo point");
        return Ok(fallback);
    }
    log::warn!("[line-search] no acceptable step within the trial budget");
    Err(LineSearchError::Exhausted)
}

// Configuration, validated once when a run starts.
struct DriverCore {
    x0: Array1<f64>,
    scales: Option<Array1<f64>>,
    lower: Option<Array1<f64>>,
    upper: Option<Array1<f64>>,
    linear: Vec<LinearConstraint>,
    gradient_mode: GradientMode,
    noise_threshold: f64,
    eval_averaging: usize,
    g_tol: f64,
    f_tol: f64,
    slow_progress_iters: usize,
    max_iterations: usize,
    c1: f64,
    curvature_c2: Option<f64>,
    max_trials: usize,
    step_growth: f64,
    alpha_reset: bool,
    hessian_init: f64,
    condition_ceiling: f64,
    cancel: Option<CancelToken>,
}

impl DriverCore {
    fn validate(&self) -> Result<(), ConfigError> {
        let n = self.x0.len();
        if n == 0 {
            return Err(ConfigError::EmptyStart);
        }
        if self.x0.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NonFiniteStart);
        }
        if let Some(scales) = &self.scales {
            if scales.len() != n {
                return Err(ConfigError::DimensionMismatch {
                    what: "variable scales",
                    expected: n,
                    found: scales.len(),
                });
            }
            for (i, &s) in scales.iter().enumerate() {
                if !s.is_finite() || s <= 0.0 {
                    return Err(ConfigError::InvalidScale { index: i });
                }
            }
        }
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            if lower.len() != n {
                return Err(ConfigError::DimensionMismatch {
                    what: "lower bounds",
                    expected: n,
                    found: lower.len(),
                });
            }
            if upper.len() != n {
                return Err(ConfigError::DimensionMismatch {
                    what: "upper bounds",
                    expected: n,
                    found: upper.len(),
                });
            }
            for i in 0..n {
                if !(lower[i] <= upper[i]) {
                    return Err(ConfigError::InvertedBounds { index: i });
                }
            }
        }
        for row in &self.linear {
            if row.coeffs.len() != n {
                return Err(ConfigError::DimensionMismatch {
                    what: "linear constraint row",
                    expected: n,
                    found: row.coeffs.len(),
                });
            }
        }
        if !(self.g_tol > 0.0) {
            return Err(ConfigError::InvalidTolerance { name: "g_tol" });
        }
        if !(self.f_tol >= 0.0) {
            return Err(ConfigError::InvalidTolerance { name: "f_tol" });
        }
        if self.slow_progress_iters == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "slow_progress_iters",
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "max_iterations",
            });
        }
        if !(self.c1 > 0.0 && self.c1 < 1.0) {
            return Err(ConfigError::InvalidParameter { name: "c1" });
        }
        if let Some(c2) = self.curvature_c2 {
            if !(c2 > self.c1 && c2 < 1.0) {
                return Err(ConfigError::InvalidParameter { name: "c2" });
            }
        }
        if self.max_trials == 0 {
            return Err(ConfigError::InvalidParameter { name: "max_trials" });
        }
        if !(self.step_growth >= 1.0) {
            return Err(ConfigError::InvalidParameter { name: "step_growth" });
        }
        if self.eval_averaging == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "eval_averaging",
            });
        }
        if !(self.noise_threshold > 0.0) {
            return Err(ConfigError::InvalidTolerance {
                name: "noise_threshold",
            });
        }
        if !(self.hessian_init > 0.0 && self.hessian_init.is_finite()) {
            return Err(ConfigError::InvalidParameter {
                name: "hessian_init",
            });
        }
        if !(self.condition_ceiling > 1.0) {
            return Err(ConfigError::InvalidParameter {
                name: "condition_ceiling",
            });
        }
        match self.gradient_mode {
            GradientMode::Analytic => {}
            GradientMode::Forward { step_scale } | GradientMode::Central { step_scale } => {
                if !(step_scale > 0.0 && step_scale.is_finite()) {
                    return Err(ConfigError::InvalidParameter { name: "step_scale" });
                }
            }
        }
        Ok(())
    }
}

/// A configurable optimization driver. Build with [`Driver::new`], adjust with
/// the `with_*` methods, then call [`Driver::run`].
pub struct Driver<ObjFn> {
    core: DriverCore,
    obj_fn: ObjFn,
}

impl<ObjFn> Driver<ObjFn>
where
    ObjFn: FnMut(&Array1<f64>) -> Result<Evaluation, EvalFailure>,
{
    /// Creates a new driver.
    ///
    /// # Arguments
    /// * `x0` - The initial design point, in physical variable space.
    /// * `obj_fn` - The expensive objective callback. It may return an
    ///   analytic gradient inside [`Evaluation`]; whether that gradient is
    ///   used depends on the configured gradient mode.
    pub fn new(x0: Array1<f64>, obj_fn: ObjFn) -> Self {
        Self {
            core: DriverCore {
                x0,
                scales: None,
                lower: None,
                upper: None,
                linear: Vec::new(),
                gradient_mode: GradientMode::Central { step_scale: 1e-6 },
                noise_threshold: 1e3,
                eval_averaging: 1,
                g_tol: 1e-6,
                f_tol: 1e-12,
                slow_progress_iters: 3,
                max_iterations: 500,
                c1: 1e-4,
                curvature_c2: None,
                max_trials: 20,
                step_growth: 2.0,
                alpha_reset: false,
                hessian_init: 1.0,
                condition_ceiling: 1e8,
                cancel: None,
            },
            obj_fn,
        }
    }

    /// Use the analytic gradient returned by the callback instead of finite
    /// differences. The run aborts if the callback stops supplying one.
    pub fn with_analytic_gradients(mut self) -> Self {
        self.core.gradient_mode = GradientMode::Analytic;
        self
    }

    /// Estimate gradients by forward differences: one extra evaluation per
    /// variable, first-order truncation error.
    pub fn with_forward_difference(mut self, step_scale: f64) -> Self {
        self.core.gradient_mode = GradientMode::Forward { step_scale };
        self
    }

    /// Estimate gradients by central differences: two extra evaluations per
    /// variable, second-order truncation error (default, `step_scale = 1e-6`).
    pub fn with_central_difference(mut self, step_scale: f64) -> Self {
        self.core.gradient_mode = GradientMode::Central { step_scale };
        self
    }

    /// Disagreement between displaced evaluations, relative to the local
    /// objective magnitude, above which a central-difference component is
    /// flagged as noisy (default: 1e3).
    pub fn with_noise_threshold(mut self, threshold: f64) -> Self {
        self.core.noise_threshold = threshold;
        self
    }

    /// Average `n` callback invocations per evaluation, for noisy objectives.
    pub fn with_eval_averaging(mut self, n: usize) -> Self {
        self.core.eval_averaging = n;
        self
    }

    /// Reference scale per variable; the driver optimizes `x_i / scale_i` so
    /// heterogeneous variables move in comparable magnitudes.
    pub fn with_scales(mut self, scales: Array1<f64>) -> Self {
        self.core.scales = Some(scales);
        self
    }

    /// Per-variable bounds in physical space. Infinite entries leave a side
    /// unbounded.
    pub fn with_bounds(mut self, lower: Array1<f64>, upper: Array1<f64>) -> Self {
        self.core.lower = Some(lower);
        self.core.upper = Some(upper);
        self
    }

    /// Add one linear inequality `coeffs · x <= upper` (physical space).
    pub fn with_linear_constraint(mut self, constraint: LinearConstraint) -> Self {
        self.core.linear.push(constraint);
        self
    }

    /// Projected-gradient infinity-norm below which the run converges
    /// (default: 1e-6).
    pub fn with_gradient_tolerance(mut self, g_tol: f64) -> Self {
        self.core.g_tol = g_tol;
        self
    }

    /// Declare convergence after `iters` consecutive iterations whose relative
    /// objective decrease stays below `f_tol` (defaults: 1e-12, 3).
    pub fn with_slow_progress(mut self, f_tol: f64, iters: usize) -> Self {
        self.core.f_tol = f_tol;
        self.core.slow_progress_iters = iters;
        self
    }

    /// Iteration budget (default: 500).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.core.max_iterations = max_iterations;
        self
    }

    /// Armijo sufficient-decrease constant and line-search trial budget
    /// (defaults: 1e-4, 20).
    pub fn with_line_search(mut self, c1: f64, max_trials: usize) -> Self {
        self.core.c1 = c1;
        self.core.max_trials = max_trials;
        self
    }

    /// Enable the strong-Wolfe curvature check with constant `c2`. Only
    /// applied in analytic gradient mode, where trial gradients are free.
    pub fn with_curvature_check(mut self, c2: f64) -> Self {
        self.core.curvature_c2 = Some(c2);
        self
    }

    /// Growth factor for warm-started initial step lengths outside the
    /// quasi-Newton state (default: 2.0).
    pub fn with_step_growth(mut self, growth: f64) -> Self {
        self.core.step_growth = growth;
        self
    }

    /// Always restart line searches at a unit step instead of warm-starting
    /// from the previous accepted step.
    pub fn with_alpha_reset(mut self, reset: bool) -> Self {
        self.core.alpha_reset = reset;
        self
    }

    /// Initial inverse-Hessian scaling: the approximation starts (and resets)
    /// at `hessian_init * I` (default: 1.0).
    pub fn with_hessian_init(mut self, hessian_init: f64) -> Self {
        self.core.hessian_init = hessian_init;
        self
    }

    /// Diagonal condition estimate above which the inverse Hessian is reset
    /// (default: 1e8).
    pub fn with_condition_ceiling(mut self, ceiling: f64) -> Self {
        self.core.condition_ceiling = ceiling;
        self
    }

    /// Observe `token` at the top of every iteration and stop cleanly once it
    /// is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.core.cancel = Some(token);
        self
    }

    /// Run the optimization to termination.
    ///
    /// Only configuration problems produce `Err`; any failure after a valid
    /// start is reported through [`RunResult::termination`] together with the
    /// complete iteration history.
    pub fn run(self) -> Result<RunResult, ConfigError> {
        let core = self.core;
        core.validate()?;
        let n = core.x0.len();
        let scales = core
            .scales
            .clone()
            .unwrap_or_else(|| Array1::<f64>::ones(n));

        let constraints = Constraints {
            lower: core.lower.as_ref().map(|b| b / &scales),
            upper: core.upper.as_ref().map(|b| b / &scales),
            linear: core
                .linear
                .iter()
                .map(|row| LinearConstraint {
                    coeffs: &row.coeffs * &scales,
                    upper: row.upper,
                })
                .collect(),
        };

        let z0 = constraints.project(&(&core.x0 / &scales));
        if let Some(row) = constraints.first_violated(&z0) {
            return Err(ConfigError::InfeasibleStart { row });
        }

        let mut adapter = Adapter::new(self.obj_fn, scales.clone(), core.eval_averaging);
        let estimator = GradientEstimator {
            mode: core.gradient_mode,
            noise_threshold: core.noise_threshold,
        };
        let mut engine = DirectionEngine::new(n, core.hessian_init, core.condition_ceiling);
        let mut history: Vec<IterationRecord> = Vec::new();
        let mut grad_evals = 0usize;

        let finish = |termination: Termination,
                      history: Vec<IterationRecord>,
                      z: &Array1<f64>,
                      value: f64,
                      gradient_norm: f64,
                      func_evals: usize,
                      grad_evals: usize| {
            log::info!(
                "[driver] finished after {} iterations ({}): f = {:.6e}, ||g|| = {:.3e}, fe = {}, ge = {}",
                history.len(),
                termination,
                value,
                gradient_norm,
                func_evals,
                grad_evals
            );
            RunResult {
                final_point: z * &scales,
                final_value: value,
                final_gradient_norm: gradient_norm,
                termination,
                iterations: history.len(),
                func_evals,
                grad_evals,
                history,
            }
        };

        // Initial evaluation and gradient.
        let mut z = z0;
        let evaluation = match adapter.evaluate(&z) {
            Ok(ev) => ev,
            Err(e) => {
                let func_evals = adapter.func_evals;
                return Ok(finish(
                    Termination::Aborted(e),
                    history,
                    &z,
                    f64::NAN,
                    f64::NAN,
                    func_evals,
                    grad_evals,
                ));
            }
        };
        let mut f = evaluation.value;
        let mut g = match estimator.gradient(&mut adapter, &z, &evaluation) {
            Ok(g) => {
                grad_evals += 1;
                g
            }
            Err(GradError::Noisy {
                gradient,
                component,
            }) => {
                grad_evals += 1;
                log::warn!("[driver] initial gradient is noisy in component {component}");
                engine.degrade();
                gradient
            }
            Err(GradError::Eval(e)) => {
                let func_evals = adapter.func_evals;
                return Ok(finish(
                    Termination::Aborted(e),
                    history,
                    &z,
                    f,
                    f64::NAN,
                    func_evals,
                    grad_evals,
                ));
            }
        };

        let mut g_norm = inf_norm(&constraints.projected_gradient(&z, &g));
        if g_norm < core.g_tol {
            let func_evals = adapter.func_evals;
            return Ok(finish(
                Termination::Converged,
                history,
                &z,
                f,
                g_norm,
                func_evals,
                grad_evals,
            ));
        }

        let mut warm_step = 1.0_f64;
        let mut ls_failures = 0usize;
        let mut slow_streak = 0usize;

        for k in 1..=core.max_iterations {
            if core.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                log::info!("[driver] cancellation observed before iteration {k}");
                let func_evals = adapter.func_evals;
                return Ok(finish(
                    Termination::Cancelled,
                    history,
                    &z,
                    f,
                    g_norm,
                    func_evals,
                    grad_evals,
                ));
            }

            let mut d = engine.direction(&g);
            constraints.zero_blocked(&z, &mut d);
            let slope = g.dot(&d);
            if !slope.is_finite() || slope >= 0.0 {
                log::warn!(
                    "[driver] non-descent direction at iteration {k} (g·d = {slope:.3e}), resetting engine"
                );
                engine.degrade();
                d = engine.direction(&g);
                constraints.zero_blocked(&z, &mut d);
            }
            let state_used = engine.state();

            let alpha_init = if core.alpha_reset || state_used == EngineState::QuasiNewton {
                1.0
            } else {
                warm_step
            };

            match line_search(&core, &mut adapter, &constraints, &z, f, &g, &d, alpha_init) {
                Ok((step, z_new, trial)) => {
                    ls_failures = 0;
                    let s = &z_new - &z;
                    let f_new = trial.value;

                    let (g_new, degraded_now) =
                        match estimator.gradient(&mut adapter, &z_new, &trial) {
                            Ok(g_new) => {
                                grad_evals += 1;
                                (g_new, false)
                            }
                            Err(GradError::Noisy {
                                gradient,
                                component,
                            }) => {
                                grad_evals += 1;
                                log::warn!(
                                    "[driver] noisy gradient in component {component} at iteration {k}, falling back to steepest descent"
                                );
                                engine.degrade();
                                (gradient, true)
                            }
                            Err(GradError::Eval(e)) => {
                                history.push(IterationRecord {
                                    iteration: k,
                                    point: &z_new * &scales,
                                    value: f_new,
                                    gradient_norm: f64::NAN,
                                    step_length: step,
                                    engine_state: state_used,
                                    accepted: true,
                                });
                                let func_evals = adapter.func_evals;
                                return Ok(finish(
                                    Termination::Aborted(e),
                                    history,
                                    &z_new,
                                    f_new,
                                    f64::NAN,
                                    func_evals,
                                    grad_evals,
                                ));
                            }
                        };

                    if !degraded_now {
                        let y = &g_new - &g;
                        engine.update(&s, &y);
                    }

                    let g_norm_new = inf_norm(&constraints.projected_gradient(&z_new, &g_new));
                    history.push(IterationRecord {
                        iteration: k,
                        point: &z_new * &scales,
                        value: f_new,
                        gradient_norm: g_norm_new,
                        step_length: step,
                        engine_state: state_used,
                        accepted: true,
                    });
                    log::debug!(
                        "[driver] iteration {k}: f = {f_new:.6e}, ||g|| = {g_norm_new:.3e}, α = {step:.3e}, state = {state_used:?}"
                    );

                    let relative_decrease = (f - f_new) / f.abs().max(1.0);
                    if relative_decrease < core.f_tol {
                        slow_streak += 1;
                    } else {
                        slow_streak = 0;
                    }

                    warm_step = (step * core.step_growth).min(MAX_WARM_STEP);
                    z = z_new;
                    f = f_new;
                    g = g_new;
                    g_norm = g_norm_new;

                    if g_norm < core.g_tol {
                        let func_evals = adapter.func_evals;
                        return Ok(finish(
                            Termination::Converged,
                            history,
                            &z,
                            f,
                            g_norm,
                            func_evals,
                            grad_evals,
                        ));
                    }
                    if slow_streak >= core.slow_progress_iters {
                        let func_evals = adapter.func_evals;
                        return Ok(finish(
                            Termination::SlowProgress,
                            history,
                            &z,
                            f,
                            g_norm,
                            func_evals,
                            grad_evals,
                        ));
                    }
                }
                Err(LineSearchError::FatalEval(e)) => {
                    history.push(IterationRecord {
                        iteration: k,
                        point: &z * &scales,
                        value: f,
                        gradient_norm: g_norm,
                        step_length: 0.0,
                        engine_state: state_used,
                        accepted: false,
                    });
                    let func_evals = adapter.func_evals;
                    return Ok(finish(
                        Termination::Aborted(e),
                        history,
                        &z,
                        f,
                        g_norm,
                        func_evals,
                        grad_evals,
                    ));
                }
                Err(LineSearchError::NotDescent) | Err(LineSearchError::Exhausted) => {
                    history.push(IterationRecord {
                        iteration: k,
                        point: &z * &scales,
                        value: f,
                        gradient_norm: g_norm,
                        step_length: 0.0,
                        engine_state: state_used,
                        accepted: false,
                    });
                    ls_failures += 1;
                    if ls_failures >= 2 {
                        log::warn!("[driver] two consecutive line search failures, stalling");
                        let func_evals = adapter.func_evals;
                        return Ok(finish(
                            Termination::Stalled,
                            history,
                            &z,
                            f,
                            g_norm,
                            func_evals,
                            grad_evals,
                        ));
                    }
                    log::warn!(
                        "[driver] line search failed at iteration {k}, retrying with steepest descent"
                    );
                    engine.degrade();
                }
            }
        }

        let func_evals = adapter.func_evals;
        Ok(finish(
            Termination::MaxIterations,
            history,
            &z,
            f,
            g_norm,
            func_evals,
            grad_evals,
        ))
    }
}

#[cfg(test)]
mod tests {
    // This test suite is structured into three parts:
    // 1. Convergence tests: the driver finds known minima, with and without
    //    analytic gradients, bounds, scaling, and constraints.
    // 2. Failure and edge case tests: evaluation failures, noisy gradients,
    //    cancellation, and configuration validation behave as documented.
    // 3. Component contract tests: adapter caching/scaling, finite-difference
    //    accuracy, the curvature guard, and the feasible-step ratio test.

    use super::*;
    use ndarray::array;
    use spectral::assert_that;
    use spectral::prelude::*;
    use std::cell::Cell;
    use std::rc::Rc;

    // --- Test Functions ---

    /// Shifted paraboloid with minimum at (3, -1).
    fn paraboloid(x: &Array1<f64>) -> Result<Evaluation, EvalFailure> {
        let f = (x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2);
        let g = array![2.0 * (x[0] - 3.0), 2.0 * (x[1] + 1.0)];
        Ok(Evaluation::with_gradient(f, g))
    }

    /// The Rosenbrock function, minimum at (1, 1).
    fn rosenbrock(x: &Array1<f64>) -> Result<Evaluation, EvalFailure> {
        let a = 1.0;
        let b = 100.0;
        let f = (a - x[0]).powi(2) + b * (x[1] - x[0].powi(2)).powi(2);
        let g = array![
            -2.0 * (a - x[0]) - 4.0 * b * (x[1] - x[0].powi(2)) * x[0],
            2.0 * b * (x[1] - x[0].powi(2))
        ];
        Ok(Evaluation::with_gradient(f, g))
    }

    /// Constant gradient, so the curvature update must always be skipped.
    fn linear_function(x: &Array1<f64>) -> Result<Evaluation, EvalFailure> {
        Ok(Evaluation::with_gradient(
            2.0 * x[0] + 3.0 * x[1],
            array![2.0, 3.0],
        ))
    }

    // --- 1. Convergence Tests ---

    #[test]
    fn paraboloid_round_trip_with_analytic_gradients() {
        let result = Driver::new(array![0.0, 0.0], paraboloid)
            .with_analytic_gradients()
            .with_gradient_tolerance(1e-8)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_that!(&result.final_point[0]).is_close_to(3.0, 1e-6);
        assert_that!(&result.final_point[1]).is_close_to(-1.0, 1e-6);
        assert!(result.iterations < 500);
        assert_eq!(result.iterations, result.history.len());
    }

    #[test]
    fn paraboloid_converges_with_central_differences() {
        let no_grad = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            Ok(Evaluation::new(
                (x[0] - 3.0).powi(2) + (x[1] + 1.0).powi(2),
            ))
        };
        let result = Driver::new(array![0.0, 0.0], no_grad)
            .with_central_difference(1e-6)
            .with_gradient_tolerance(1e-5)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_that!(&result.final_point[0]).is_close_to(3.0, 1e-4);
        assert_that!(&result.final_point[1]).is_close_to(-1.0, 1e-4);
    }

    #[test]
    fn rosenbrock_converges_and_descends_monotonically() {
        let result = Driver::new(array![-1.2, 1.0], rosenbrock)
            .with_analytic_gradients()
            .with_gradient_tolerance(1e-6)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_that!(&result.final_point[0]).is_close_to(1.0, 1e-4);
        assert_that!(&result.final_point[1]).is_close_to(1.0, 1e-4);

        let accepted: Vec<f64> = result
            .history
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.value)
            .collect();
        for pair in accepted.windows(2) {
            assert!(
                pair[1] <= pair[0],
                "objective increased from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn first_iteration_uses_steepest_descent_then_quasi_newton() {
        let result = Driver::new(array![-1.2, 1.0], rosenbrock)
            .with_analytic_gradients()
            .run()
            .unwrap();

        assert_eq!(result.history[0].engine_state, EngineState::SteepestDescent);
        assert!(result
            .history
            .iter()
            .any(|r| r.engine_state == EngineState::QuasiNewton));
    }

    #[test]
    fn bounded_paraboloid_converges_to_the_boundary() {
        let result = Driver::new(array![0.0, 0.0], paraboloid)
            .with_analytic_gradients()
            .with_bounds(
                array![f64::NEG_INFINITY, f64::NEG_INFINITY],
                array![1.0, f64::INFINITY],
            )
            .with_gradient_tolerance(1e-8)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_that!(&result.final_point[0]).is_close_to(1.0, 1e-6);
        assert_that!(&result.final_point[1]).is_close_to(-1.0, 1e-6);
        for record in &result.history {
            assert!(
                record.point[0] <= 1.0 + 1e-8,
                "iterate {} violates the bound",
                record.point[0]
            );
        }
    }

    #[test]
    fn scaling_reaches_the_same_minimum() {
        let result = Driver::new(array![0.0, 0.0], paraboloid)
            .with_analytic_gradients()
            .with_scales(array![10.0, 0.1])
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_that!(&result.final_point[0]).is_close_to(3.0, 1e-5);
        assert_that!(&result.final_point[1]).is_close_to(-1.0, 1e-5);
    }

    #[test]
    fn linear_constraint_keeps_the_trace_feasible() {
        // The unconstrained minimum (3, -1) violates x0 + x1 <= 0, so the
        // driver runs into the constraint wall and stalls there: without an
        // active-set method the ratio test blocks every outward direction.
        let result = Driver::new(array![-1.0, 0.0], paraboloid)
            .with_analytic_gradients()
            .with_linear_constraint(LinearConstraint::new(array![1.0, 1.0], 0.0))
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Stalled);
        for record in &result.history {
            assert!(
                record.point[0] + record.point[1] <= 1e-8,
                "iterate violates the linear constraint"
            );
        }
        assert!(result.final_value < 17.0);
    }

    #[test]
    fn start_at_minimum_terminates_without_iterations() {
        let result = Driver::new(array![3.0, -1.0], paraboloid)
            .with_analytic_gradients()
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_eq!(result.iterations, 0);
        assert_that!(&result.history).has_length(0);
    }

    // --- 2. Failure and Edge Case Tests ---

    #[test]
    fn max_iterations_is_reported_with_full_history() {
        let result = Driver::new(array![-1.2, 1.0], rosenbrock)
            .with_analytic_gradients()
            .with_max_iterations(5)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::MaxIterations);
        assert_eq!(result.iterations, 5);
        assert_that!(&result.history).has_length(5);
    }

    #[test]
    fn zero_curvature_never_promotes_the_engine() {
        let result = Driver::new(array![10.0, 10.0], linear_function)
            .with_analytic_gradients()
            .with_max_iterations(25)
            .with_slow_progress(0.0, usize::MAX)
            .run()
            .unwrap();

        // s·y = 0 on a linear objective: every update is skipped and the
        // engine never reaches the quasi-Newton state.
        assert_eq!(result.termination, Termination::MaxIterations);
        for record in &result.history {
            assert_eq!(record.engine_state, EngineState::SteepestDescent);
        }
    }

    #[test]
    fn evaluation_failures_shrink_the_step_and_still_converge() {
        // A hard wall past x = 70: the solver diverges there, so the callback
        // reports failure and the line search must shrink through it.
        let wall = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            if x[0] > 70.0 {
                Err(EvalFailure::new("solver diverged"))
            } else {
                Ok(Evaluation::with_gradient(
                    (x[0] - 60.0).powi(2),
                    array![2.0 * (x[0] - 60.0)],
                ))
            }
        };
        let result = Driver::new(array![0.0], wall)
            .with_analytic_gradients()
            .with_gradient_tolerance(1e-8)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert_that!(&result.final_point[0]).is_close_to(60.0, 1e-6);
    }

    #[test]
    fn unconditional_failure_aborts_with_empty_history() {
        let broken =
            |_: &Array1<f64>| -> Result<Evaluation, EvalFailure> { Err(EvalFailure::new("down")) };
        let result = Driver::new(array![1.0, 2.0], broken).run().unwrap();

        assert!(matches!(
            result.termination,
            Termination::Aborted(EvalError::Callback(_))
        ));
        assert_that!(&result.history).has_length(0);
        assert!(result.final_value.is_nan());
        assert!(result.func_evals >= 1);
    }

    #[test]
    fn missing_analytic_gradient_aborts() {
        let value_only =
            |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> { Ok(Evaluation::new(x.dot(x))) };
        let result = Driver::new(array![1.0, 2.0], value_only)
            .with_analytic_gradients()
            .run()
            .unwrap();

        assert!(matches!(
            result.termination,
            Termination::Aborted(EvalError::MissingGradient)
        ));
    }

    #[test]
    fn slow_progress_terminates_on_a_flat_valley() {
        let result = Driver::new(array![-1.2, 1.0], rosenbrock)
            .with_analytic_gradients()
            .with_gradient_tolerance(1e-14)
            .with_slow_progress(1e-2, 2)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::SlowProgress);
        assert!(result.iterations < 500);
    }

    #[test]
    fn pre_cancelled_token_yields_no_records() {
        let token = CancelToken::new();
        token.cancel();
        let result = Driver::new(array![-1.2, 1.0], rosenbrock)
            .with_analytic_gradients()
            .with_cancel_token(token)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Cancelled);
        assert_eq!(result.iterations, 0);
        assert_that!(&result.history).has_length(0);
    }

    #[test]
    fn cancellation_keeps_exactly_the_recorded_iterations() {
        // The token is set during the first line-search trial of iteration 1;
        // the iteration finishes, records itself, and the check at the top of
        // iteration 2 stops the run with exactly one complete record.
        let token = CancelToken::new();
        let observer = token.clone();
        let calls = Rc::new(Cell::new(0usize));
        let counter = calls.clone();
        let cancelling = move |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            counter.set(counter.get() + 1);
            if counter.get() == 2 {
                observer.cancel();
            }
            rosenbrock(x)
        };
        let result = Driver::new(array![-1.2, 1.0], cancelling)
            .with_analytic_gradients()
            .with_cancel_token(token)
            .run()
            .unwrap();

        assert_eq!(result.termination, Termination::Cancelled);
        assert_that!(&result.history).has_length(1);
        let record = &result.history[0];
        assert!(record.accepted);
        assert!(record.value.is_finite());
        assert!(record.gradient_norm.is_finite());
        assert!(record.step_length > 0.0);
    }

    #[test]
    fn configuration_errors_are_rejected_before_any_evaluation() {
        let count = Rc::new(Cell::new(0usize));
        let counter = count.clone();
        let counting = move |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            counter.set(counter.get() + 1);
            Ok(Evaluation::new(x.dot(x)))
        };

        let inverted = Driver::new(array![0.0, 0.0], counting)
            .with_bounds(array![1.0, 0.0], array![-1.0, 1.0])
            .run();
        assert!(matches!(
            inverted,
            Err(ConfigError::InvertedBounds { index: 0 })
        ));
        assert_eq!(count.get(), 0);

        let bad_tol = Driver::new(array![0.0], |x: &Array1<f64>| Ok(Evaluation::new(x[0])))
            .with_gradient_tolerance(0.0)
            .run();
        assert!(matches!(
            bad_tol,
            Err(ConfigError::InvalidTolerance { name: "g_tol" })
        ));

        let bad_scale = Driver::new(array![0.0], |x: &Array1<f64>| Ok(Evaluation::new(x[0])))
            .with_scales(array![-2.0])
            .run();
        assert!(matches!(
            bad_scale,
            Err(ConfigError::InvalidScale { index: 0 })
        ));

        let bad_row = Driver::new(array![0.0], |x: &Array1<f64>| Ok(Evaluation::new(x[0])))
            .with_linear_constraint(LinearConstraint::new(array![1.0, 2.0], 0.0))
            .run();
        assert!(matches!(bad_row, Err(ConfigError::DimensionMismatch { .. })));

        let infeasible = Driver::new(array![1.0], |x: &Array1<f64>| Ok(Evaluation::new(x[0])))
            .with_linear_constraint(LinearConstraint::new(array![1.0], 0.0))
            .run();
        assert!(matches!(
            infeasible,
            Err(ConfigError::InfeasibleStart { row: 0 })
        ));
    }

    // --- 3. Component Contract Tests ---

    #[test]
    fn adapter_caches_repeated_evaluations() {
        let count = Rc::new(Cell::new(0usize));
        let counter = count.clone();
        let counting = move |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            counter.set(counter.get() + 1);
            Ok(Evaluation::new(x.dot(x)))
        };
        let mut adapter = Adapter::new(counting, array![1.0, 1.0], 1);

        let z = array![0.5, -0.5];
        let first = adapter.evaluate(&z).unwrap();
        let second = adapter.evaluate(&z).unwrap();
        assert_eq!(first, second);
        assert_eq!(count.get(), 1);
        assert_eq!(adapter.func_evals, 1);

        adapter.evaluate(&array![0.5, 0.5]).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn adapter_applies_the_chain_rule_to_scaled_gradients() {
        let obj = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            Ok(Evaluation::with_gradient(x[0] + x[1], array![3.0, 5.0]))
        };
        let mut adapter = Adapter::new(obj, array![2.0, 4.0], 1);

        let ev = adapter.evaluate(&array![1.0, 1.0]).unwrap();
        let g = ev.gradient.unwrap();
        assert_that!(&g[0]).is_close_to(6.0, 1e-12);
        assert_that!(&g[1]).is_close_to(20.0, 1e-12);
    }

    #[test]
    fn adapter_averages_repeated_noisy_evaluations() {
        let count = Rc::new(Cell::new(0usize));
        let counter = count.clone();
        let alternating = move |_: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            counter.set(counter.get() + 1);
            let wobble = if counter.get() % 2 == 0 { 1.0 } else { -1.0 };
            Ok(Evaluation::new(10.0 + wobble))
        };
        let mut adapter = Adapter::new(alternating, array![1.0], 4);

        let ev = adapter.evaluate(&array![0.0]).unwrap();
        assert_that!(&ev.value).is_close_to(10.0, 1e-12);
        assert_eq!(adapter.func_evals, 4);
    }

    #[test]
    fn central_difference_matches_the_analytic_quadratic_gradient() {
        // f(x) = xᵀx has gradient 2x; a central difference on a quadratic is
        // exact up to rounding in the divided difference.
        let obj =
            |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> { Ok(Evaluation::new(x.dot(x))) };
        let mut adapter = Adapter::new(obj, array![1.0, 1.0], 1);
        let estimator = GradientEstimator {
            mode: GradientMode::Central { step_scale: 1e-6 },
            noise_threshold: 1e3,
        };

        let z = array![0.7, -1.3];
        let at = adapter.evaluate(&z).unwrap();
        let g = match estimator.gradient(&mut adapter, &z, &at) {
            Ok(g) => g,
            Err(_) => panic!("gradient estimation failed"),
        };
        assert_that!(&g[0]).is_close_to(1.4, 1e-6);
        assert_that!(&g[1]).is_close_to(-2.6, 1e-6);
    }

    #[test]
    fn forward_difference_stays_within_first_order_error() {
        let obj =
            |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> { Ok(Evaluation::new(x.dot(x))) };
        let mut adapter = Adapter::new(obj, array![1.0], 1);
        let estimator = GradientEstimator {
            mode: GradientMode::Forward { step_scale: 1e-6 },
            noise_threshold: 1e3,
        };

        let z = array![2.0];
        let at = adapter.evaluate(&z).unwrap();
        let g = match estimator.gradient(&mut adapter, &z, &at) {
            Ok(g) => g,
            Err(_) => panic!("gradient estimation failed"),
        };
        // Truncation error of a forward difference is h·f''/2 = h here.
        assert_that!(&g[0]).is_close_to(4.0, 1e-4);
    }

    #[test]
    fn displaced_evaluations_that_disagree_wildly_are_flagged_noisy() {
        let jumpy = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
            if x[0] > 1.0 {
                Ok(Evaluation::new(1e9))
            } else {
                Ok(Evaluation::new(x[0] * x[0]))
            }
        };
        let mut adapter = Adapter::new(jumpy, array![1.0], 1);
        let estimator = GradientEstimator {
            mode: GradientMode::Central { step_scale: 1e-6 },
            noise_threshold: 1e3,
        };

        let z = array![1.0];
        let at = adapter.evaluate(&z).unwrap();
        match estimator.gradient(&mut adapter, &z, &at) {
            Err(GradError::Noisy { component, .. }) => assert_eq!(component, 0),
            _ => panic!("expected a noisy gradient"),
        }
    }

    #[test]
    fn corrupted_inverse_hessian_is_not_a_descent_direction_and_degrades() {
        // An indefinite approximation flips the direction uphill; the driver
        // detects g·d >= 0 and resets the engine, which the degraded state and
        // identity approximation make observable.
        let mut engine = DirectionEngine::new(2, 1.0, 1e8);
        engine.state = EngineState::QuasiNewton;
        engine.h_inv = array![[-1.0, 0.0], [0.0, -1.0]];

        let g = array![1.0, 2.0];
        let d = engine.direction(&g);
        assert!(g.dot(&d) >= 0.0);

        engine.degrade();
        assert_eq!(engine.state(), EngineState::Degraded);
        let d = engine.direction(&g);
        assert!(g.dot(&d) < 0.0);

        // The next successful curvature update restores quasi-Newton mode.
        engine.update(&array![0.1, 0.1], &array![0.2, 0.2]);
        assert_eq!(engine.state(), EngineState::QuasiNewton);
    }

    #[test]
    fn curvature_guard_skips_updates_that_lose_positive_definiteness() {
        let mut engine = DirectionEngine::new(2, 1.0, 1e8);
        let before = engine.h_inv.clone();

        // s·y < 0: applying this update would destroy positive-definiteness.
        engine.update(&array![1.0, 0.0], &array![-1.0, 0.0]);
        assert_eq!(engine.h_inv, before);
        assert_eq!(engine.state(), EngineState::SteepestDescent);

        // A legitimate update is applied and stays SPD.
        engine.update(&array![1.0, 0.0], &array![2.0, 0.0]);
        assert_eq!(engine.state(), EngineState::QuasiNewton);
        assert!(chol_decompose(&engine.h_inv).is_some());
    }

    #[test]
    fn ratio_test_caps_the_feasible_step() {
        let constraints = Constraints {
            lower: Some(array![0.0, f64::NEG_INFINITY]),
            upper: Some(array![10.0, f64::INFINITY]),
            linear: vec![LinearConstraint::new(array![1.0, 1.0], 4.0)],
        };

        let z = array![1.0, 1.0];
        // Bound on x0 allows 9/2 = 4.5; the linear row allows 2/3.
        let alpha = constraints.max_feasible_step(&z, &array![2.0, 1.0]);
        assert_that!(&alpha).is_close_to(2.0 / 3.0, 1e-12);

        // Moving toward the lower bound is capped by it.
        let alpha = constraints.max_feasible_step(&z, &array![-2.0, 0.0]);
        assert_that!(&alpha).is_close_to(0.5, 1e-12);

        // A direction with no feasible extent at the boundary caps at zero.
        let at_wall = array![2.0, 2.0];
        let alpha = constraints.max_feasible_step(&at_wall, &array![1.0, 1.0]);
        assert_that!(&alpha).is_close_to(0.0, 1e-12);
    }

    #[test]
    fn projection_clips_into_the_box() {
        let constraints = Constraints {
            lower: Some(array![-1.0, -1.0]),
            upper: Some(array![1.0, 1.0]),
            linear: Vec::new(),
        };
        let projected = constraints.project(&array![-3.0, 0.5]);
        assert_eq!(projected, array![-1.0, 0.5]);
    }
}
