use crate::common::*;
use crate::embedding::{Embedding, EmbeddingKey, EmbeddingMethod, Scope};

use matrix_util::dmatrix_rsvd::RSVD;
use matrix_util::traits::MatOps;
use serde::{Deserialize, Serialize};

/// Above this many cells and features the exact covariance is no
/// longer built by default
pub const DEFAULT_MAX_EXACT_DIM: usize = 3000;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum PcaSolver {
    /// symmetric eigendecomposition of the smaller covariance
    Exact,
    /// seeded randomized SVD
    Randomized { seed: u64 },
    /// `Exact` while the smaller covariance is at most
    /// `max_exact_dim` wide, `Randomized { seed }` beyond
    Auto { max_exact_dim: usize, seed: u64 },
}

impl Default for PcaSolver {
    fn default() -> Self {
        PcaSolver::Auto {
            max_exact_dim: DEFAULT_MAX_EXACT_DIM,
            seed: DEFAULT_SEED,
        }
    }
}

impl PcaSolver {
    /// The concrete solver for an `nn × pp` scaled matrix
    pub fn resolve(self, nn: usize, pp: usize) -> PcaSolver {
        match self {
            PcaSolver::Auto { max_exact_dim, seed } => {
                if nn.min(pp) <= max_exact_dim {
                    PcaSolver::Exact
                } else {
                    PcaSolver::Randomized { seed }
                }
            }
            solver => solver,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PcaArgs {
    pub n_pcs: usize,
    /// clip scaled values to `[-scale_max, scale_max]`
    pub scale_max: Option<f32>,
    pub solver: PcaSolver,
}

impl Default for PcaArgs {
    fn default() -> Self {
        PcaArgs {
            n_pcs: DEFAULT_N_PCS,
            scale_max: Some(10.0),
            solver: PcaSolver::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PcaResult {
    /// cells × components
    pub embedding: Embedding,
    /// genes × components
    pub loadings: Mat,
    pub genes: Vec<Box<str>>,
    /// variance along each component
    pub variance: Vec<f32>,
    /// fraction of the total variance of the scaled matrix
    pub variance_ratio: Vec<f32>,
    pub cumulative: Vec<f32>,
    pub exclusions: Vec<Exclusion>,
}

impl PcaResult {
    pub fn num_components(&self) -> usize {
        self.variance.len()
    }

    pub fn variance_lines(&self) -> Vec<Box<str>> {
        let mut lines: Vec<Box<str>> = vec!["component\tvariance\tvariance_ratio\tcumulative".into()];
        for (k, name) in self.embedding.components.iter().enumerate() {
            lines.push(
                format!(
                    "{}\t{}\t{}\t{}",
                    name, self.variance[k], self.variance_ratio[k], self.cumulative[k]
                )
                .into_boxed_str(),
            );
        }
        lines
    }

    pub fn loading_lines(&self) -> Vec<Box<str>> {
        let mut hdr = vec!["gene".to_string()];
        hdr.extend(self.embedding.components.iter().map(|c| c.to_string()));
        let mut lines: Vec<Box<str>> = vec![hdr.join("\t").into_boxed_str()];
        for (g, gene) in self.genes.iter().enumerate() {
            let mut fields = vec![gene.to_string()];
            fields.extend(self.loadings.row(g).iter().map(|x| format!("{}", x)));
            lines.push(fields.join("\t").into_boxed_str());
        }
        lines
    }
}

/// Dense cells × genes matrix of the selected genes, z-scored per gene
/// and optionally clipped
pub fn scale_expression(data: &CscMat, selected: &[usize], scale_max: Option<f32>) -> Mat {
    let mut position = vec![None; data.nrows()];
    for (k, &g) in selected.iter().enumerate() {
        position[g] = Some(k);
    }

    let mut xx = Mat::zeros(data.ncols(), selected.len());
    for (j, col) in data.col_iter().enumerate() {
        for (&g, &v) in col.row_indices().iter().zip(col.values()) {
            if let Some(k) = position[g] {
                xx[(j, k)] = v;
            }
        }
    }

    xx.scale_columns_inplace();

    if let Some(smax) = scale_max {
        xx.apply(|x| *x = x.clamp(-smax, smax));
    }
    xx
}

/// Flip each column so its largest absolute entry is positive
fn fix_signs(loadings: &mut Mat, scores: &mut Mat) {
    for k in 0..loadings.ncols() {
        let col = loadings.column(k);
        let mut best = 0;
        for g in 1..col.len() {
            if col[g].abs() > col[best].abs() {
                best = g;
            }
        }
        if col.len() > 0 && col[best] < 0.0 {
            loadings.column_mut(k).neg_mut();
            scores.column_mut(k).neg_mut();
        }
    }
}

/// Eigenvalues (descending) and unit eigenvectors of the covariance of
/// the columns of `xx`, using whichever of the gene or cell dimension
/// is smaller
fn exact_components(xx: &Mat, rank: usize) -> (Vec<f32>, Mat) {
    let (nn, pp) = (xx.nrows(), xx.ncols());
    let denom = (nn - 1) as f32;

    let (values, vectors, gram) = if pp <= nn {
        let cov = (xx.transpose() * xx) / denom;
        let eig = cov.symmetric_eigen();
        (eig.eigenvalues, eig.eigenvectors, false)
    } else {
        debug!("PCA via the [{} x {}] cell covariance", nn, nn);
        let cov = (xx * xx.transpose()) / denom;
        let eig = cov.symmetric_eigen();
        (eig.eigenvalues, eig.eigenvectors, true)
    };

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    order.truncate(rank);

    let mut loadings = Mat::zeros(pp, order.len());
    let mut lambda = Vec::with_capacity(order.len());
    for (k, &i) in order.iter().enumerate() {
        lambda.push(values[i].max(0.0));
        if gram {
            let v = xx.transpose() * vectors.column(i);
            let norm = v.norm();
            if norm > 0.0 {
                loadings.column_mut(k).copy_from(&(v / norm));
            }
        } else {
            loadings.column_mut(k).copy_from(&vectors.column(i));
        }
    }
    (lambda, loadings)
}

fn randomized_components(xx: &Mat, rank: usize, seed: u64) -> anyhow::Result<(Vec<f32>, Mat)> {
    let denom = (xx.nrows() - 1) as f32;
    let (_u, d, v) = xx.rsvd(rank, seed)?;
    let lambda = d.iter().map(|s| s * s / denom).collect();
    Ok((lambda, v))
}

/// Principal components of the scaled selected genes over all cells
///
/// * `data` - normalized expression, genes × cells
/// * `genes` - symbols of every row of `data`
/// * `selected` - rows to use, in feature rank order
/// * `cells` - identifiers of the columns of `data`
///
pub fn run_pca(
    data: &CscMat,
    genes: &[Box<str>],
    selected: &[usize],
    cells: &[Box<str>],
    args: &PcaArgs,
) -> anyhow::Result<PcaResult> {
    let nn = data.ncols();
    let pp = selected.len();

    if nn < 2 || pp == 0 {
        return Err(PipelineError::DegenerateInput {
            stage: "pca".into(),
            detail: format!("{} cells × {} features", nn, pp).into(),
        }
        .into());
    }
    if args.n_pcs == 0 {
        anyhow::bail!("number of principal components must be positive");
    }

    let xx = scale_expression(data, selected, args.scale_max);
    let total_variance: f32 = xx.column_iter().map(|c| c.norm_squared()).sum::<f32>() / (nn - 1) as f32;

    let rank = args.n_pcs.min(pp).min(nn);
    let solver = args.solver.resolve(nn, pp);
    info!(
        "PCA: {} cells × {} features, {} components ({:?})",
        nn, pp, rank, solver
    );

    let (lambda, loadings) = match solver {
        PcaSolver::Randomized { seed } => randomized_components(&xx, rank, seed)?,
        _ => exact_components(&xx, rank),
    };

    let tol = 1e-6 * lambda.first().copied().unwrap_or(0.0).max(f32::EPSILON);
    let mut keep = vec![];
    let mut exclusions = vec![];
    for (k, &l) in lambda.iter().enumerate() {
        if l > tol {
            keep.push(k);
        } else {
            exclusions.push(Exclusion::new(
                "pca",
                &format!("component {}", k + 1),
                &format!("zero variance ({:e})", l),
            ));
        }
    }
    if keep.is_empty() {
        return Err(PipelineError::DegenerateInput {
            stage: "pca".into(),
            detail: "scaled expression has no variance".into(),
        }
        .into());
    }

    let mut loadings = loadings.select_columns(&keep);
    let mut scores = &xx * &loadings;
    fix_signs(&mut loadings, &mut scores);

    let variance: Vec<f32> = keep.iter().map(|&k| lambda[k]).collect();
    let variance_ratio: Vec<f32> = variance
        .iter()
        .map(|v| if total_variance > 0.0 { v / total_variance } else { 0.0 })
        .collect();
    let cumulative: Vec<f32> = variance_ratio
        .iter()
        .scan(0.0, |acc, r| {
            *acc += r;
            Some(*acc)
        })
        .collect();

    if let Some(last) = cumulative.last() {
        info!("PCA: {} components explain {:.1}% of variance", keep.len(), last * 100.0);
    }

    let solver = match solver {
        PcaSolver::Randomized { seed } => format!("randomized:{}", seed),
        _ => "exact".to_string(),
    };
    let key = EmbeddingKey::new(
        EmbeddingMethod::Pca,
        Scope::Pooled,
        &[
            ("n_pcs", args.n_pcs.to_string()),
            ("n_features", pp.to_string()),
            ("scale_max", format!("{:?}", args.scale_max)),
            ("solver", solver),
        ],
    );
    let embedding = Embedding::new(
        key,
        cells.to_vec(),
        Embedding::component_names("PC", keep.len()),
        scores,
    )?;

    Ok(PcaResult {
        embedding,
        loadings,
        genes: selected.iter().map(|&g| genes[g].clone()).collect(),
        variance,
        variance_ratio,
        cumulative,
        exclusions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;

    /// genes × cells CSC with two latent factors plus noise
    fn low_rank_data(n_genes: usize, n_cells: usize) -> anyhow::Result<CscMat> {
        let ww = Mat::rnorm_seeded(n_genes, 2, 1);
        let hh = Mat::rnorm_seeded(2, n_cells, 2);
        let noise = Mat::rnorm_seeded(n_genes, n_cells, 3) * 0.05;
        let yy = &ww * &hh * 3.0 + noise;
        let mut trip = vec![];
        for j in 0..n_cells {
            for i in 0..n_genes {
                trip.push((i, j, yy[(i, j)]));
            }
        }
        csc_from_triplets(n_genes, n_cells, &trip)
    }

    fn names(prefix: &str, n: usize) -> Vec<Box<str>> {
        (0..n).map(|i| format!("{}{}", prefix, i).into()).collect()
    }

    #[test]
    fn test_scaled_columns() -> anyhow::Result<()> {
        let data = low_rank_data(6, 40)?;
        let xx = scale_expression(&data, &[4, 1], None);
        assert_eq!(xx.shape(), (40, 2));
        for col in xx.column_iter() {
            assert_abs_diff_eq!(col.mean(), 0.0, epsilon = 1e-4);
            assert_abs_diff_eq!(col.norm_squared() / 39.0, 1.0, epsilon = 1e-3);
        }
        let clipped = scale_expression(&data, &[4, 1], Some(0.5));
        assert!(clipped.iter().all(|x| x.abs() <= 0.5));
        Ok(())
    }

    #[test]
    fn test_components_are_ordered_and_signed() -> anyhow::Result<()> {
        let (n_genes, n_cells) = (20, 60);
        let data = low_rank_data(n_genes, n_cells)?;
        let selected: Vec<usize> = (0..n_genes).collect();
        let args = PcaArgs {
            n_pcs: 5,
            scale_max: None,
            ..Default::default()
        };
        let out = run_pca(&data, &names("G", n_genes), &selected, &names("c", n_cells), &args)?;

        assert_eq!(out.embedding.coords.shape(), (n_cells, 5));
        assert_eq!(out.loadings.shape(), (n_genes, 5));
        assert!(out.variance.windows(2).all(|w| w[0] >= w[1]));
        // two latent factors dominate
        assert!(out.cumulative[1] > 0.95);
        assert!(out.cumulative.windows(2).all(|w| w[0] <= w[1] + 1e-6));

        for k in 0..5 {
            let col = out.loadings.column(k);
            assert_abs_diff_eq!(col.norm(), 1.0, epsilon = 1e-3);
            let imax = col.iamax();
            assert!(col[imax] > 0.0);
        }
        assert_eq!(out.variance_lines().len(), 6);
        assert_eq!(out.loading_lines().len(), n_genes + 1);
        Ok(())
    }

    #[test]
    fn test_gene_and_cell_covariance_agree() -> anyhow::Result<()> {
        // more genes than cells switches to the cell covariance
        let (n_genes, n_cells) = (30, 12);
        let data = low_rank_data(n_genes, n_cells)?;
        let selected: Vec<usize> = (0..n_genes).collect();
        let args = PcaArgs {
            n_pcs: 3,
            scale_max: None,
            ..Default::default()
        };
        let out = run_pca(&data, &names("G", n_genes), &selected, &names("c", n_cells), &args)?;
        let rsvd = PcaArgs {
            solver: PcaSolver::Randomized { seed: 7 },
            ..args.clone()
        };
        let approx = run_pca(&data, &names("G", n_genes), &selected, &names("c", n_cells), &rsvd)?;

        for k in 0..2 {
            assert_abs_diff_eq!(out.variance[k], approx.variance[k], epsilon = 1e-2 * out.variance[0]);
            let dot = out.loadings.column(k).dot(&approx.loadings.column(k));
            assert_abs_diff_eq!(dot, 1.0, epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn test_auto_solver_switches_on_size() -> anyhow::Result<()> {
        let (n_genes, n_cells) = (20, 60);
        let data = low_rank_data(n_genes, n_cells)?;
        let selected: Vec<usize> = (0..n_genes).collect();
        let (genes, cells) = (names("G", n_genes), names("c", n_cells));
        let with = |solver: PcaSolver| PcaArgs {
            n_pcs: 4,
            solver,
            ..Default::default()
        };

        let small = PcaSolver::Auto { max_exact_dim: 10, seed: 7 };
        assert_eq!(small.resolve(n_cells, n_genes), PcaSolver::Randomized { seed: 7 });
        let auto = run_pca(&data, &genes, &selected, &cells, &with(small))?;
        let rsvd = run_pca(&data, &genes, &selected, &cells, &with(PcaSolver::Randomized { seed: 7 }))?;
        assert_eq!(auto, rsvd);
        assert!(auto.embedding.key.params.contains("solver=randomized:7"));

        let large = PcaSolver::Auto { max_exact_dim: 20, seed: 7 };
        let auto = run_pca(&data, &genes, &selected, &cells, &with(large))?;
        let exact = run_pca(&data, &genes, &selected, &cells, &with(PcaSolver::Exact))?;
        assert_eq!(auto, exact);
        Ok(())
    }

    #[test]
    fn test_deterministic_and_degenerate() -> anyhow::Result<()> {
        let data = low_rank_data(10, 25)?;
        let selected: Vec<usize> = (0..10).collect();
        let genes = names("G", 10);
        let cells = names("c", 25);
        let a = run_pca(&data, &genes, &selected, &cells, &PcaArgs::default())?;
        let b = run_pca(&data, &genes, &selected, &cells, &PcaArgs::default())?;
        assert_eq!(a, b);

        let constant = csc_from_triplets(2, 5, &(0..5).map(|j| (0, j, 1.0)).collect::<Vec<_>>())?;
        let err = run_pca(&constant, &names("G", 2), &[0, 1], &names("c", 5), &PcaArgs::default())
            .err()
            .expect("no variance");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DegenerateInput { .. })
        ));
        Ok(())
    }
}
