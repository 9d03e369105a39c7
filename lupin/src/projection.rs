use crate::common::*;
use crate::embedding::{Embedding, EmbeddingKey, EmbeddingMethod};

use matrix_util::dmatrix_util::*;
use matrix_util::knn_graph::{KnnGraph, KnnGraphArgs};
use matrix_util::traits::{MatOps, SampleOps};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Two-dimensional projections for display; never used for clustering
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectionArgs {
    pub umap: bool,
    pub tsne: bool,
    /// leading dimensions of the input embedding
    pub n_dims: usize,
    pub umap_neighbours: usize,
    pub umap_epochs: usize,
    /// curve `1 / (1 + a d^2b)`; these fit `min_dist = 0.3`
    pub umap_a: f32,
    pub umap_b: f32,
    pub tsne_perplexity: f32,
    pub tsne_iter: usize,
    pub seed: u64,
    pub block_size: usize,
}

impl ProjectionArgs {
    /// Requested projection methods, UMAP first
    pub fn methods(&self) -> Vec<EmbeddingMethod> {
        let mut ret = vec![];
        if self.umap {
            ret.push(EmbeddingMethod::Umap);
        }
        if self.tsne {
            ret.push(EmbeddingMethod::Tsne);
        }
        ret
    }
}

impl Default for ProjectionArgs {
    fn default() -> Self {
        ProjectionArgs {
            umap: false,
            tsne: false,
            n_dims: DEFAULT_N_DIMS,
            umap_neighbours: 30,
            umap_epochs: 200,
            umap_a: 0.9922,
            umap_b: 1.1123,
            tsne_perplexity: 30.0,
            tsne_iter: 1000,
            seed: DEFAULT_SEED,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Leading two principal axes of `xx`, rescaled so the largest absolute
/// coordinate is `extent`
fn pca_init(xx: &Mat, extent: f32) -> Mat {
    let n = xx.nrows();
    let centred = xx.centre_columns();
    let eig = (centred.transpose() * &centred).symmetric_eigen();

    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eig.eigenvalues[b]
            .total_cmp(&eig.eigenvalues[a])
            .then(a.cmp(&b))
    });

    let mut coords = Mat::zeros(n, 2);
    for (k, &i) in order.iter().take(2).enumerate() {
        let mut v = eig.eigenvectors.column(i).into_owned();
        if v[v.iamax()] < 0.0 {
            v.neg_mut();
        }
        coords.column_mut(k).copy_from(&(&centred * v));
    }

    let top = coords.amax();
    if top > 0.0 {
        coords *= extent / top;
    }
    coords
}

#[inline]
fn clip(x: f32) -> f32 {
    x.clamp(-4.0, 4.0)
}

/// UMAP layout by stochastic gradient descent on the fuzzy kNN graph
/// with negative sampling (McInnes et al. 2018)
pub struct Umap {
    n_neighbours: usize,
    n_epochs: usize,
    a: f32,
    b: f32,
    negative_rate: usize,
    learning_rate: f32,
    seed: u64,
    block_size: usize,
}

impl Default for Umap {
    fn default() -> Self {
        Self {
            n_neighbours: 30,
            n_epochs: 200,
            a: 0.9922,
            b: 1.1123,
            negative_rate: 5,
            learning_rate: 1.0,
            seed: DEFAULT_SEED,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Umap {
    pub fn n_neighbours(mut self, k: usize) -> Self {
        self.n_neighbours = k;
        self
    }

    pub fn n_epochs(mut self, n: usize) -> Self {
        self.n_epochs = n;
        self
    }

    pub fn curve(mut self, a: f32, b: f32) -> Self {
        self.a = a;
        self.b = b;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// n x 2 layout of the rows of `xx`
    pub fn fit(&self, xx: &Mat) -> anyhow::Result<Mat> {
        let nn = xx.nrows();
        if nn < 3 {
            anyhow::bail!("UMAP needs at least 3 points, got {}", nn);
        }

        let graph = KnnGraph::from_rows(
            xx,
            KnnGraphArgs {
                knn: self.n_neighbours.min(nn - 1),
                block_size: self.block_size,
                reciprocal: false,
            },
        )?;
        let weights = graph.fuzzy_kernel_weights();
        debug!(
            "UMAP graph: {} nodes, {} edges",
            graph.num_nodes(),
            graph.num_edges()
        );
        let w_max = weights.iter().cloned().fold(0.0f32, f32::max);
        if w_max <= 0.0 {
            anyhow::bail!("UMAP graph has no positive edge weights");
        }

        let mut yy = pca_init(xx, 10.0);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let (a, b) = (self.a, self.b);

        for epoch in 0..self.n_epochs {
            let alpha = self.learning_rate * (1.0 - epoch as f32 / self.n_epochs as f32);

            for (e, &(i, j)) in graph.edges.iter().enumerate() {
                if rng.random::<f32>() * w_max > weights[e] {
                    continue;
                }

                let d2 = row_distance_sq(&yy, i, &yy, j);
                if d2 > 0.0 {
                    let coef = -2.0 * a * b * d2.powf(b - 1.0) / (1.0 + a * d2.powf(b));
                    for c in 0..2 {
                        let g = clip(coef * (yy[(i, c)] - yy[(j, c)])) * alpha;
                        yy[(i, c)] += g;
                        yy[(j, c)] -= g;
                    }
                }

                for _ in 0..self.negative_rate {
                    let k = rng.random_range(0..nn);
                    if k == i {
                        continue;
                    }
                    let d2 = row_distance_sq(&yy, i, &yy, k);
                    for c in 0..2 {
                        let g = if d2 > 0.0 {
                            let coef = 2.0 * b / ((0.001 + d2) * (1.0 + a * d2.powf(b)));
                            clip(coef * (yy[(i, c)] - yy[(k, c)]))
                        } else {
                            4.0
                        };
                        yy[(i, c)] += g * alpha;
                    }
                }
            }

            if (epoch + 1) % 50 == 0 {
                debug!("UMAP epoch {}/{}", epoch + 1, self.n_epochs);
            }
        }

        Ok(yy)
    }
}

/// Exact t-SNE with early exaggeration, momentum and adaptive gains
/// (van der Maaten & Hinton 2008)
pub struct TSne {
    perplexity: f32,
    learning_rate: f32,
    n_iter: usize,
    early_exaggeration: f32,
    early_exaggeration_iter: usize,
    seed: u64,
}

impl Default for TSne {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            learning_rate: 200.0,
            n_iter: 1000,
            early_exaggeration: 12.0,
            early_exaggeration_iter: 250,
            seed: DEFAULT_SEED,
        }
    }
}

impl TSne {
    pub fn perplexity(mut self, p: f32) -> Self {
        self.perplexity = p;
        self
    }

    pub fn n_iter(mut self, n: usize) -> Self {
        self.n_iter = n;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// n x 2 layout of the rows of `xx`
    pub fn fit(&self, xx: &Mat) -> anyhow::Result<Mat> {
        let nn = xx.nrows();
        if nn < 4 {
            anyhow::bail!("t-SNE needs at least 4 points, got {}", nn);
        }

        let max_perplexity = (nn - 1) as f32 / 3.0;
        let perplexity = if self.perplexity > max_perplexity {
            warn!(
                "perplexity {} too large for {} points; using {}",
                self.perplexity, nn, max_perplexity
            );
            max_perplexity
        } else {
            self.perplexity
        };

        let pp = joint_probabilities(xx, perplexity);

        let mut yy = Mat::rnorm_seeded(nn, 2, self.seed) * 1e-4;
        let mut velocity = Mat::zeros(nn, 2);
        let mut gains = Mat::from_element(nn, 2, 1.0f32);

        for iter in 0..self.n_iter {
            let exaggeration = if iter < self.early_exaggeration_iter {
                self.early_exaggeration
            } else {
                1.0
            };
            let momentum = if iter < self.early_exaggeration_iter { 0.5 } else { 0.8 };

            let grad = tsne_gradient(&pp, &yy, exaggeration);

            for i in 0..nn {
                for c in 0..2 {
                    let g = grad[(i, c)];
                    let v = velocity[(i, c)];
                    gains[(i, c)] = if (g > 0.0) != (v > 0.0) {
                        gains[(i, c)] + 0.2
                    } else {
                        (gains[(i, c)] * 0.8).max(0.01)
                    };
                    velocity[(i, c)] = momentum * v - self.learning_rate * gains[(i, c)] * g;
                    yy[(i, c)] += velocity[(i, c)];
                }
            }

            yy.centre_columns_inplace();

            if (iter + 1) % 250 == 0 {
                debug!("t-SNE iteration {}/{}", iter + 1, self.n_iter);
            }
        }

        Ok(yy)
    }
}

/// Symmetric affinities `P_ij = (p_j|i + p_i|j) / 2n` with each
/// conditional calibrated to the target perplexity
fn joint_probabilities(xx: &Mat, perplexity: f32) -> Mat {
    let nn = xx.nrows();
    let target_entropy = perplexity.ln();

    let rows: Vec<Vec<f32>> = (0..nn)
        .into_par_iter()
        .map(|i| {
            let dist: Vec<f32> = (0..nn).map(|j| row_distance_sq(xx, i, xx, j)).collect();
            let sigma = binary_search_sigma(&dist, i, target_entropy);
            conditional_row(&dist, i, sigma)
        })
        .collect();

    let mut pp = Mat::zeros(nn, nn);
    let denom = 2.0 * nn as f32;
    for i in 0..nn {
        for j in 0..nn {
            pp[(i, j)] = ((rows[i][j] + rows[j][i]) / denom).max(1e-12);
        }
    }
    pp
}

fn conditional_row(dist_sq: &[f32], i: usize, sigma: f32) -> Vec<f32> {
    let mut p: Vec<f32> = dist_sq
        .iter()
        .enumerate()
        .map(|(j, &d2)| {
            if j == i {
                0.0
            } else {
                (-d2 / (2.0 * sigma * sigma)).exp()
            }
        })
        .collect();
    let tot: f32 = p.iter().sum();
    if tot > 1e-10 {
        p.iter_mut().for_each(|x| *x /= tot);
    }
    p
}

fn entropy(dist_sq: &[f32], i: usize, sigma: f32) -> f32 {
    conditional_row(dist_sq, i, sigma)
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum()
}

/// Bisection on sigma until the conditional entropy matches the target
fn binary_search_sigma(dist_sq: &[f32], i: usize, target: f32) -> f32 {
    let (mut lo, mut hi) = (1e-10f32, 1e4f32);
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        if entropy(dist_sq, i, mid) > target {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    (lo + hi) / 2.0
}

/// `dC/dy_i = 4 sum_j (e P_ij - Q_ij) (y_i - y_j) / (1 + |y_i - y_j|^2)`
fn tsne_gradient(pp: &Mat, yy: &Mat, exaggeration: f32) -> Mat {
    let nn = yy.nrows();

    // unnormalized student-t kernel, one row at a time
    let kernel: Vec<Vec<f32>> = (0..nn)
        .into_par_iter()
        .map(|i| {
            (0..nn)
                .map(|j| {
                    if i == j {
                        0.0
                    } else {
                        1.0 / (1.0 + row_distance_sq(yy, i, yy, j))
                    }
                })
                .collect()
        })
        .collect();

    let z: f32 = kernel.iter().map(|row| row.iter().sum::<f32>()).sum::<f32>().max(1e-12);

    let grads: Vec<[f32; 2]> = (0..nn)
        .into_par_iter()
        .map(|i| {
            let mut g = [0.0f32; 2];
            for j in 0..nn {
                if i == j {
                    continue;
                }
                let k = kernel[i][j];
                let coef = 4.0 * (exaggeration * pp[(i, j)] - k / z) * k;
                for (c, gc) in g.iter_mut().enumerate() {
                    *gc += coef * (yy[(i, c)] - yy[(j, c)]);
                }
            }
            g
        })
        .collect();

    Mat::from_fn(nn, 2, |i, c| grads[i][c])
}

/// Project the leading `args.n_dims` components of `input` to two
/// dimensions with UMAP or t-SNE
pub fn project_embedding(
    input: &Embedding,
    method: EmbeddingMethod,
    args: &ProjectionArgs,
) -> anyhow::Result<Embedding> {
    let n_dims = args.n_dims.min(input.num_components());
    let xx = input.leading(n_dims);

    info!(
        "{} projection of {} ({} cells, {} dims)",
        method,
        input.key,
        input.num_cells(),
        n_dims
    );

    let (coords, params, prefix) = match method {
        EmbeddingMethod::Umap => {
            let coords = Umap::default()
                .n_neighbours(args.umap_neighbours)
                .n_epochs(args.umap_epochs)
                .curve(args.umap_a, args.umap_b)
                .seed(args.seed)
                .block_size(args.block_size)
                .fit(&xx)?;
            let params = vec![
                ("n_neighbours", args.umap_neighbours.to_string()),
                ("epochs", args.umap_epochs.to_string()),
                ("a", format!("{}", args.umap_a)),
                ("b", format!("{}", args.umap_b)),
            ];
            (coords, params, "UMAP")
        }
        EmbeddingMethod::Tsne => {
            let coords = TSne::default()
                .perplexity(args.tsne_perplexity)
                .n_iter(args.tsne_iter)
                .seed(args.seed)
                .fit(&xx)?;
            let params = vec![
                ("perplexity", format!("{}", args.tsne_perplexity)),
                ("iter", args.tsne_iter.to_string()),
            ];
            (coords, params, "TSNE")
        }
        other => anyhow::bail!("{} is not a two-dimensional projection", other),
    };

    let mut params = params;
    params.insert(0, ("input", input.key.to_string()));
    params.push(("n_dims", n_dims.to_string()));
    params.push(("seed", args.seed.to_string()));

    Embedding::new(
        EmbeddingKey::new(method, input.key.scope.clone(), &params),
        input.cells.clone(),
        Embedding::component_names(prefix, 2),
        coords,
    )
}
