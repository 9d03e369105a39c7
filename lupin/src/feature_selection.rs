use crate::common::*;
use crate::normalize::NormalizedExpression;

use matrix_util::sparse_stat::SparseRunningStatistics;
use matrix_util::traits::RunningStatOps;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// variance at or below this fraction of `max(mean², 1)` counts as zero
const ZERO_VARIANCE_TOL: f64 = 1e-6;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FeatureSelectionArgs {
    pub n_features: usize,
    /// fraction of genes in each local regression window
    pub loess_span: f64,
}

impl Default for FeatureSelectionArgs {
    fn default() -> Self {
        FeatureSelectionArgs {
            n_features: DEFAULT_N_FEATURES,
            loess_span: 0.3,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeneVarianceStat {
    pub gene: Box<str>,
    pub mean: f32,
    pub variance: f32,
    /// trend value of log10(variance), NaN for excluded genes
    pub fitted: f64,
    /// standardized residual of log10(variance) around the trend
    pub excess: f64,
    pub selected: bool,
}

/// Genes flagged as variable. The gene set itself is untouched; this
/// only records which rows to use downstream.
#[derive(Clone, Debug)]
pub struct FeatureSelection {
    pub stats: Vec<GeneVarianceStat>,
    /// selected gene rows, by descending excess
    pub selected: Vec<usize>,
    pub exclusions: Vec<Exclusion>,
}

impl FeatureSelection {
    pub fn num_selected(&self) -> usize {
        self.selected.len()
    }

    pub fn selected_genes(&self) -> Vec<Box<str>> {
        self.selected.iter().map(|&g| self.stats[g].gene.clone()).collect()
    }

    pub fn to_lines(&self) -> Vec<Box<str>> {
        let mut lines: Vec<Box<str>> = vec!["gene\tmean\tvariance\tfitted\texcess\tselected".into()];
        lines.extend(self.stats.iter().map(|s| {
            format!(
                "{}\t{}\t{}\t{:.6}\t{:.6}\t{}",
                s.gene, s.mean, s.variance, s.fitted, s.excess, s.selected
            )
            .into_boxed_str()
        }));
        lines
    }
}

/// Local linear regression with tricube weights.
///
/// For every point, the `ceil(span * n)` nearest neighbours in `x`
/// form the window; returns the fitted value at each input point in
/// input order.
pub fn loess_fit(x: &[f64], y: &[f64], span: f64) -> anyhow::Result<Vec<f64>> {
    if x.len() != y.len() {
        anyhow::bail!("loess: {} x values vs {} y values", x.len(), y.len());
    }
    if !(span > 0.0 && span <= 1.0) {
        anyhow::bail!("loess span must be in (0, 1], got {}", span);
    }
    let n = x.len();
    if n == 0 {
        return Ok(vec![]);
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]).then(a.cmp(&b)));
    let xs: Vec<f64> = order.iter().map(|&i| x[i]).collect();
    let ys: Vec<f64> = order.iter().map(|&i| y[i]).collect();

    let q = ((span * n as f64).ceil() as usize).max(3).min(n);

    let fitted_sorted: Vec<f64> = (0..n)
        .into_par_iter()
        .map(|i| {
            let x0 = xs[i];

            // slide the q-window towards x0
            let mut lo = (i + 1).saturating_sub(q).min(n - q);
            while lo + q < n && lo < i && x0 - xs[lo] > xs[lo + q] - x0 {
                lo += 1;
            }
            let hi = lo + q;

            let h = (x0 - xs[lo]).max(xs[hi - 1] - x0);

            let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
            for k in lo..hi {
                let w = if h > 0.0 {
                    let u = ((xs[k] - x0).abs() / h).min(1.0);
                    (1.0 - u * u * u).powi(3)
                } else {
                    1.0
                };
                sw += w;
                swx += w * xs[k];
                swy += w * ys[k];
                swxx += w * xs[k] * xs[k];
                swxy += w * xs[k] * ys[k];
            }

            if sw <= 0.0 {
                return ys[i];
            }
            let denom = sw * swxx - swx * swx;
            if denom.abs() <= 1e-12 * sw * sw {
                swy / sw
            } else {
                let slope = (sw * swxy - swx * swy) / denom;
                let intercept = (swy - slope * swx) / sw;
                intercept + slope * x0
            }
        })
        .collect();

    let mut ret = vec![0.0; n];
    for (k, &i) in order.iter().enumerate() {
        ret[i] = fitted_sorted[k];
    }
    Ok(ret)
}

/// Rank genes by standardized residual of the log10 variance-mean trend
/// over all cells and flag the top `n_features`.
///
/// Ties in the residual are broken by gene symbol. Genes with zero
/// variance cannot be placed on the log scale and are excluded.
pub fn select_features(
    normalized: &NormalizedExpression,
    genes: &[Box<str>],
    args: &FeatureSelectionArgs,
) -> anyhow::Result<FeatureSelection> {
    let data = &normalized.data;
    if genes.len() != data.nrows() {
        return Err(PipelineError::DimensionMismatch {
            what: "gene symbols".into(),
            expected: format!("{}", data.nrows()).into(),
            found: format!("{}", genes.len()).into(),
        }
        .into());
    }

    let mut stat = SparseRunningStatistics::<f64>::new(data.nrows());
    stat.add_csc(data);
    let mean = stat.mean();
    let variance = stat.sample_variance();

    let mut exclusions = vec![];
    let mut eligible = vec![];
    for g in 0..genes.len() {
        let (mu, v) = (mean[g], variance[g]);
        if !(mu > 0.0 && v.is_finite() && v > ZERO_VARIANCE_TOL * (mu * mu).max(1.0)) {
            exclusions.push(Exclusion::new("feature_selection", &genes[g], "zero variance"));
        } else {
            eligible.push(g);
        }
    }

    if eligible.is_empty() {
        return Err(PipelineError::DegenerateInput {
            stage: "feature_selection".into(),
            detail: format!("all {} genes have zero variance", genes.len()).into(),
        }
        .into());
    }

    let lx: Vec<f64> = eligible.iter().map(|&g| mean[g].log10()).collect();
    let ly: Vec<f64> = eligible.iter().map(|&g| variance[g].log10()).collect();

    let fitted = loess_fit(&lx, &ly, args.loess_span)?;

    let resid: Vec<f64> = ly.iter().zip(fitted.iter()).map(|(y, f)| y - f).collect();
    let nr = resid.len() as f64;
    let rbar = resid.iter().sum::<f64>() / nr;
    let rsd = (resid.iter().map(|r| (r - rbar) * (r - rbar)).sum::<f64>() / (nr - 1.0).max(1.0)).sqrt();
    let rsd = if rsd > 0.0 { rsd } else { 1.0 };

    let mut stats: Vec<GeneVarianceStat> = (0..genes.len())
        .map(|g| GeneVarianceStat {
            gene: genes[g].clone(),
            mean: mean[g] as f32,
            variance: variance[g] as f32,
            fitted: f64::NAN,
            excess: f64::NAN,
            selected: false,
        })
        .collect();

    for (k, &g) in eligible.iter().enumerate() {
        stats[g].fitted = fitted[k];
        stats[g].excess = resid[k] / rsd;
    }

    let mut ranked = eligible.clone();
    ranked.sort_by(|&a, &b| {
        stats[b]
            .excess
            .total_cmp(&stats[a].excess)
            .then_with(|| stats[a].gene.cmp(&stats[b].gene))
    });
    ranked.truncate(args.n_features);

    for &g in &ranked {
        stats[g].selected = true;
    }

    info!(
        "selected {} of {} genes ({} excluded)",
        ranked.len(),
        genes.len(),
        exclusions.len()
    );

    Ok(FeatureSelection {
        stats,
        selected: ranked,
        exclusions,
    })
}
