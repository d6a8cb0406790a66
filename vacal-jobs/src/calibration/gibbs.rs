//! Built-in Gibbs-sampling calibration engine
//!
//! Model, per algorithm `j` with observed predicted-cause counts `v_j`:
//!
//! ```text
//! p      ~ Dirichlet(1, ..., 1)                  true cause fractions
//! M_j[a] ~ Dirichlet(strength * prior_j[a])      P(predicted | true = a)
//! v_j    ~ Multinomial(n_j, p' M_j)
//! ```
//!
//! Each iteration allocates the records predicted as `b` to latent true causes
//! with weights `p_a * M_j[a, b]`, then redraws `p` from its Dirichlet posterior.
//! With several algorithms the allocations are averaged so the same deaths are
//! not counted once per algorithm. The full-uncertainty variant also redraws
//! each `M_j` row; the fixed variant keeps `M_j` at the prior.

use ndarray::{Array1, Array2, Array3, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution, Gamma};
use std::sync::Arc;

use super::priors::{ParametricPriors, PriorProvider};
use super::{CalibrationEngine, CalibrationError, CalibrationRequest, RawCalibration};
use crate::models::{CalibrationVariant, McmcParams};

/// Lower and upper credible quantiles
const CREDIBLE_LOW: f64 = 0.025;
const CREDIBLE_HIGH: f64 = 0.975;

pub struct GibbsEngine {
    priors: Arc<dyn PriorProvider>,
    prior_strength: f64,
}

impl GibbsEngine {
    pub fn new(priors: Arc<dyn PriorProvider>, prior_strength: f64) -> Self {
        Self {
            priors,
            prior_strength,
        }
    }

    /// Engine over the parametric priors
    pub fn parametric(prior_strength: f64) -> Self {
        Self::new(Arc::new(ParametricPriors), prior_strength)
    }

    fn chain(
        &self,
        counts: &[Vec<u64>],
        priors: &[Array2<f64>],
        variant: CalibrationVariant,
        mcmc: &McmcParams,
        seed: u64,
    ) -> Result<Posterior, CalibrationError> {
        let c = priors[0].nrows();
        let k = counts.len() as f64;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut p = vec![1.0 / c as f64; c];
        let mut m: Vec<Array2<f64>> = priors.to_vec();
        let mut samples = Vec::with_capacity(mcmc.retained_samples());
        let mut m_sum: Vec<Array2<f64>> = priors.iter().map(|pr| Array2::zeros(pr.raw_dim())).collect();

        for iter in 0..mcmc.n_mcmc {
            let mut z_total = vec![0.0; c];

            for (j, v) in counts.iter().enumerate() {
                let mut z = Array2::<f64>::zeros((c, c));
                for (b, &n_b) in v.iter().enumerate() {
                    if n_b == 0 {
                        continue;
                    }
                    let weights: Vec<f64> = (0..c).map(|a| p[a] * m[j][[a, b]]).collect();
                    let alloc = multinomial(&mut rng, n_b, &weights)?;
                    for (a, x) in alloc.into_iter().enumerate() {
                        z[[a, b]] = x as f64;
                        z_total[a] += x as f64;
                    }
                }

                if variant == CalibrationVariant::FullUncertainty {
                    for a in 0..c {
                        let alpha: Vec<f64> = (0..c)
                            .map(|b| self.prior_strength * priors[j][[a, b]] + z[[a, b]])
                            .collect();
                        let row = dirichlet(&mut rng, &alpha)?;
                        for (b, value) in row.into_iter().enumerate() {
                            m[j][[a, b]] = value;
                        }
                    }
                }
            }

            let alpha: Vec<f64> = z_total.iter().map(|z| 1.0 + z / k).collect();
            p = dirichlet(&mut rng, &alpha)?;

            if iter >= mcmc.n_burn && (iter - mcmc.n_burn) % mcmc.n_thin == 0 {
                samples.push(p.clone());
                for (sum, current) in m_sum.iter_mut().zip(&m) {
                    *sum += current;
                }
            }
        }

        let retained = samples.len().max(1) as f64;
        Ok(Posterior {
            summary: summarize(&samples, c),
            misclassification: m_sum.into_iter().map(|s| s / retained).collect(),
        })
    }
}

struct Posterior {
    summary: Summary,
    /// Posterior mean misclassification matrix per algorithm
    misclassification: Vec<Array2<f64>>,
}

struct Summary {
    mean: Vec<f64>,
    low: Vec<f64>,
    high: Vec<f64>,
}

impl CalibrationEngine for GibbsEngine {
    fn calibrate(&self, request: &CalibrationRequest<'_>) -> Result<RawCalibration, CalibrationError> {
        request.mcmc.validate().map_err(CalibrationError::Failed)?;
        let n = request.inputs.len();
        if n == 0 {
            return Err(CalibrationError::NoInput);
        }
        if request.ensemble && n < 2 {
            return Err(CalibrationError::EnsembleTooSmall(n));
        }
        if !request.ensemble && n != 1 {
            return Err(CalibrationError::Shape(format!("{} inputs without ensemble", n)));
        }

        let causes = request.causes();
        let c = causes.len();
        let mut counts = Vec::with_capacity(n);
        let mut uncalibrated = Vec::with_capacity(n);
        let mut priors = Vec::with_capacity(n);
        for (algorithm, matrix) in &request.inputs {
            counts.push(matrix.column_counts().into_iter().map(|x| x as u64).collect::<Vec<u64>>());
            uncalibrated.push(matrix.column_means());
            priors.push(self.priors.misclassification_prior(
                *algorithm,
                request.age_group,
                &request.country,
                &causes,
            )?);
        }

        tracing::debug!(
            algorithms = n,
            causes = c,
            ensemble = request.ensemble,
            n_mcmc = request.mcmc.n_mcmc,
            "Running Gibbs sampler"
        );

        if !request.ensemble {
            let post = self.chain(&counts, &priors, request.variant, &request.mcmc, request.mcmc.seed)?;
            return Ok(RawCalibration {
                uncalibrated: Array1::from(uncalibrated.swap_remove(0)).into_dyn(),
                mean: Array1::from(post.summary.mean).into_dyn(),
                low: Array1::from(post.summary.low).into_dyn(),
                high: Array1::from(post.summary.high).into_dyn(),
                misclassification: post
                    .misclassification
                    .into_iter()
                    .next()
                    .ok_or(CalibrationError::NoInput)?
                    .into_dyn(),
            });
        }

        // One chain per algorithm, then a joint chain for the ensemble row
        let mut summaries = Vec::with_capacity(n + 1);
        for j in 0..n {
            let seed = request.mcmc.seed.wrapping_add(1 + j as u64);
            let post = self.chain(&counts[j..=j], &priors[j..=j], request.variant, &request.mcmc, seed)?;
            summaries.push(post.summary);
        }
        let joint = self.chain(&counts, &priors, request.variant, &request.mcmc, request.mcmc.seed)?;
        summaries.push(joint.summary);

        let ensemble_row: Vec<f64> = (0..c)
            .map(|k| uncalibrated.iter().map(|u| u[k]).sum::<f64>() / n as f64)
            .collect();
        uncalibrated.push(ensemble_row);

        let mut tensor = Array3::<f64>::zeros((n, c, c));
        for (j, m) in joint.misclassification.iter().enumerate() {
            tensor.index_axis_mut(Axis(0), j).assign(m);
        }

        Ok(RawCalibration {
            uncalibrated: stack_rows(&uncalibrated, c)?,
            mean: stack_rows(&summaries.iter().map(|s| s.mean.clone()).collect::<Vec<_>>(), c)?,
            low: stack_rows(&summaries.iter().map(|s| s.low.clone()).collect::<Vec<_>>(), c)?,
            high: stack_rows(&summaries.iter().map(|s| s.high.clone()).collect::<Vec<_>>(), c)?,
            misclassification: tensor.into_dyn(),
        })
    }
}

fn stack_rows(rows: &[Vec<f64>], c: usize) -> Result<ArrayD<f64>, CalibrationError> {
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), c), flat)
        .map(|a| a.into_dyn())
        .map_err(|e| CalibrationError::Shape(e.to_string()))
}

/// Posterior mean and equal-tailed credible bounds per component
fn summarize(samples: &[Vec<f64>], c: usize) -> Summary {
    let n = samples.len();
    let mut mean = vec![0.0; c];
    let mut low = vec![0.0; c];
    let mut high = vec![0.0; c];
    if n == 0 {
        return Summary { mean, low, high };
    }

    for k in 0..c {
        let mut column: Vec<f64> = samples.iter().map(|s| s[k]).collect();
        mean[k] = column.iter().sum::<f64>() / n as f64;
        column.sort_by(|a, b| a.total_cmp(b));
        low[k] = quantile(&column, CREDIBLE_LOW).min(mean[k]);
        high[k] = quantile(&column, CREDIBLE_HIGH).max(mean[k]);
    }
    Summary { mean, low, high }
}

/// Linear-interpolated quantile of sorted values
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Dirichlet draw via normalized Gamma variates; non-positive weights give 0
fn dirichlet(rng: &mut StdRng, alpha: &[f64]) -> Result<Vec<f64>, CalibrationError> {
    let mut draws = Vec::with_capacity(alpha.len());
    for &a in alpha {
        if a <= 0.0 || !a.is_finite() {
            draws.push(0.0);
            continue;
        }
        let gamma = Gamma::new(a, 1.0).map_err(|e| CalibrationError::Failed(format!("gamma({}): {}", a, e)))?;
        draws.push(gamma.sample(rng));
    }

    let total: f64 = draws.iter().sum();
    if total > 0.0 && total.is_finite() {
        return Ok(draws.into_iter().map(|d| d / total).collect());
    }
    // All draws underflowed: fall back to the normalized weights
    let total: f64 = alpha.iter().filter(|a| **a > 0.0).sum();
    if total <= 0.0 {
        return Err(CalibrationError::Failed("Dirichlet weights are all zero".to_string()));
    }
    Ok(alpha.iter().map(|a| a.max(0.0) / total).collect())
}

/// Multinomial draw as a sequence of conditional binomials
fn multinomial(rng: &mut StdRng, n: u64, weights: &[f64]) -> Result<Vec<u64>, CalibrationError> {
    let mut out = vec![0u64; weights.len()];
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    let Some(last) = weights.iter().rposition(|w| *w > 0.0) else {
        // No information: spread evenly
        let len = weights.len().max(1) as u64;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = n / len + u64::from((i as u64) < n % len);
        }
        return Ok(out);
    };

    let mut remaining = n;
    let mut mass = total;
    for (k, &w) in weights.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if k == last {
            out[k] = remaining;
            break;
        }
        if w <= 0.0 {
            continue;
        }
        let prob = (w / mass).clamp(0.0, 1.0);
        let x = if prob >= 1.0 {
            remaining
        } else {
            Binomial::new(remaining, prob)
                .map_err(|e| CalibrationError::Failed(format!("binomial({}, {}): {}", remaining, prob, e)))?
                .sample(rng)
        };
        out[k] = x;
        remaining -= x;
        mass -= w;
    }
    Ok(out)
}
