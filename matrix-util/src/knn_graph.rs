use fnv::FnvHashMap as HashMap;
use indicatif::ParallelProgressIterator;
use log::info;
use nalgebra::DMatrix;
use rayon::prelude::*;

const DEFAULT_BLOCK_SIZE: usize = 1000;

/// Neighbour lists: for each query point, `(index, distance)` pairs
/// sorted by ascending distance, ties broken by the smaller index
pub type NeighbourLists = Vec<Vec<(usize, f32)>>;

pub struct KnnGraph {
    /// Sorted edge list (i < j), deduplicated
    pub edges: Vec<(usize, usize)>,
    /// Edge distances, parallel to `edges`
    pub distances: Vec<f32>,
    /// Directed neighbour lists that produced the graph (self excluded)
    pub neighbours: NeighbourLists,
    /// Number of nodes
    pub n_nodes: usize,
}

pub struct KnnGraphArgs {
    pub knn: usize,
    pub block_size: usize,
    /// If true, keep only reciprocal edges (i→j AND j→i).
    /// If false, keep union edges (i→j OR j→i), using min distance.
    pub reciprocal: bool,
}

fn rows_to_vecs(data: &DMatrix<f32>) -> Vec<Vec<f32>> {
    data.row_iter()
        .map(|r| r.iter().copied().collect())
        .collect()
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Exact k-nearest-neighbour search of every row of `query` among the
/// rows of `reference`.
///
/// * `query` - n x d matrix; each row is a point
/// * `reference` - m x d matrix
/// * `knn` - number of neighbours to report per query
/// * `skip_self` - when query and reference are the same set, do not
///   report the point itself
/// * `block_size` - rows per parallel job
///
pub fn knn_search(
    query: &DMatrix<f32>,
    reference: &DMatrix<f32>,
    knn: usize,
    skip_self: bool,
    block_size: usize,
) -> anyhow::Result<NeighbourLists> {
    if query.ncols() != reference.ncols() {
        anyhow::bail!(
            "query has {} columns, reference has {}",
            query.ncols(),
            reference.ncols()
        );
    }

    let qq = rows_to_vecs(query);
    let rr = rows_to_vecs(reference);
    let nn = qq.len();

    let jobs = create_jobs(nn, block_size);
    let njobs = jobs.len() as u64;

    let mut blocks: Vec<(usize, NeighbourLists)> = jobs
        .into_par_iter()
        .progress_count(njobs)
        .map(|(lb, ub)| {
            let lists = (lb..ub)
                .map(|i| {
                    let mut cand: Vec<(usize, f32)> = rr
                        .iter()
                        .enumerate()
                        .filter(|&(j, _)| !(skip_self && i == j))
                        .map(|(j, r_j)| (j, euclidean(&qq[i], r_j)))
                        .collect();
                    let kk = knn.min(cand.len());
                    let order = |a: &(usize, f32), b: &(usize, f32)| {
                        a.1.total_cmp(&b.1).then(a.0.cmp(&b.0))
                    };
                    if kk < cand.len() && kk > 0 {
                        cand.select_nth_unstable_by(kk - 1, order);
                    }
                    cand.truncate(kk);
                    cand.sort_by(order);
                    cand
                })
                .collect::<Vec<_>>();
            (lb, lists)
        })
        .collect();

    blocks.sort_by_key(|&(lb, _)| lb);
    Ok(blocks.into_iter().flat_map(|(_, x)| x).collect())
}

impl KnnGraph {
    /// Build a KNN graph from row vectors (cells × features).
    ///
    /// * `data` - matrix (n x d), where each row is a point
    /// * `args` - KNN graph construction parameters
    pub fn from_rows(data: &DMatrix<f32>, args: KnnGraphArgs) -> anyhow::Result<KnnGraph> {
        let nn = data.nrows();
        if nn < 2 {
            anyhow::bail!("need at least two points for a kNN graph, got {}", nn);
        }

        /////////////////////////////////////////////////////////////////
        // step 1: searching nearest neighbours                        //
        /////////////////////////////////////////////////////////////////

        let neighbours = knn_search(data, data, args.knn.max(1), true, args.block_size)?;

        let mut triplets: HashMap<(usize, usize), f32> = HashMap::default();
        for (i, nbrs) in neighbours.iter().enumerate() {
            for &(j, d_ij) in nbrs {
                triplets.insert((i, j), d_ij);
            }
        }

        info!("{} triplets by kNN matching", triplets.len());

        if triplets.is_empty() {
            return Err(anyhow::anyhow!("empty triplets"));
        }

        ///////////////////////////////////////////////////
        // step 2: edge filtering (reciprocal or union) //
        ///////////////////////////////////////////////////

        let mut edges: Vec<((usize, usize), f32)> = if args.reciprocal {
            triplets
                .iter()
                .filter_map(|(&(i, j), &d_ij)| {
                    if i < j && triplets.contains_key(&(j, i)) {
                        Some(((i, j), d_ij))
                    } else {
                        None
                    }
                })
                .collect()
        } else {
            triplets
                .iter()
                .filter_map(|(&(i, j), &d_ij)| {
                    if i < j {
                        let d_ji = triplets.get(&(j, i)).copied().unwrap_or(d_ij);
                        Some(((i, j), d_ij.min(d_ji)))
                    } else if i > j && !triplets.contains_key(&(j, i)) {
                        Some(((j, i), d_ij))
                    } else {
                        None
                    }
                })
                .collect()
        };

        edges.sort_by_key(|&(ij, _)| ij);
        edges.dedup_by_key(|&mut (ij, _)| ij);

        info!(
            "{} edges after {} matching",
            edges.len(),
            if args.reciprocal {
                "reciprocal"
            } else {
                "union"
            }
        );

        let (edge_pairs, distances): (Vec<_>, Vec<_>) = edges.into_iter().unzip();

        Ok(KnnGraph {
            edges: edge_pairs,
            distances,
            neighbours,
            n_nodes: nn,
        })
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Adaptive-bandwidth kernel weights with local connectivity.
    ///
    /// Per-point sigma calibration makes every node have the same
    /// effective number of neighbours. The rho subtraction and
    /// fuzzy-union symmetrization follow UMAP (McInnes et al. 2018).
    ///
    /// 1. rho_i = distance to nearest neighbor
    /// 2. sigma_i via binary search: sum_j exp(-(d_ij - rho_i)/sigma_i) = log2(k)
    /// 3. Directed weight: w(i→j) = exp(-(d_ij - rho_i) / sigma_i)
    /// 4. Symmetrize: w_sym = w(i→j) + w(j→i) - w(i→j) * w(j→i)
    ///
    /// Directed distances come from `self.neighbours`, so a union edge
    /// seen from one side only gets a zero weight on the other side.
    /// Returns weights parallel to `self.edges`, all in (0, 1].
    pub fn fuzzy_kernel_weights(&self) -> Vec<f32> {
        if self.distances.is_empty() {
            return Vec::new();
        }

        let mut rho = vec![0.0f32; self.n_nodes];
        let mut sigma = vec![1.0f32; self.n_nodes];

        for (i, nbrs) in self.neighbours.iter().enumerate() {
            if nbrs.is_empty() {
                continue;
            }
            let dists: Vec<f32> = nbrs.iter().map(|&(_, d)| d).collect();
            rho[i] = dists.iter().cloned().fold(f32::INFINITY, f32::min);
            let target = (dists.len() as f32).log2();
            sigma[i] = smooth_knn_sigma(&dists, rho[i], target);
        }

        let directed = |from: usize, to: usize| -> f32 {
            self.neighbours[from]
                .iter()
                .find(|&&(j, _)| j == to)
                .map(|&(_, d)| d)
                .unwrap_or(f32::INFINITY)
        };

        self.edges
            .iter()
            .map(|&(i, j)| {
                let w_ij = directed_umap_weight(directed(i, j), rho[i], sigma[i]);
                let w_ji = directed_umap_weight(directed(j, i), rho[j], sigma[j]);
                w_ij + w_ji - w_ij * w_ji
            })
            .collect()
    }
}

/// Shared-nearest-neighbour graph from neighbour lists.
///
/// Each node's neighbourhood is its list plus itself. Two nodes are
/// linked with the Jaccard index `|N(i) ∩ N(j)| / |N(i) ∪ N(j)|`, and
/// edges below `prune` are dropped. Returns sorted `(i, j, w)` with
/// `i < j`.
pub fn shared_neighbour_edges(neighbours: &NeighbourLists, prune: f32) -> Vec<(usize, usize, f32)> {
    let nn = neighbours.len();

    let sets: Vec<Vec<usize>> = neighbours
        .iter()
        .enumerate()
        .map(|(i, nbrs)| {
            let mut s: Vec<usize> = nbrs.iter().map(|&(j, _)| j).collect();
            s.push(i);
            s.sort_unstable();
            s.dedup();
            s
        })
        .collect();

    // node -> nodes whose neighbourhood contains it
    let mut inverted: Vec<Vec<usize>> = vec![vec![]; nn];
    for (i, s) in sets.iter().enumerate() {
        for &n in s {
            inverted[n].push(i);
        }
    }

    let mut edges: Vec<(usize, usize, f32)> = (0..nn)
        .into_par_iter()
        .flat_map_iter(|i| {
            let mut shared: HashMap<usize, usize> = HashMap::default();
            for &n in &sets[i] {
                for &j in &inverted[n] {
                    if j > i {
                        *shared.entry(j).or_default() += 1;
                    }
                }
            }
            let size_i = sets[i].len();
            let sets = &sets;
            shared
                .into_iter()
                .filter_map(move |(j, inter)| {
                    let union = size_i + sets[j].len() - inter;
                    let w = inter as f32 / union as f32;
                    (w >= prune).then_some((i, j, w))
                })
                .collect::<Vec<_>>()
        })
        .collect();

    edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    edges
}

/// Mutual nearest neighbours between the rows of `aa` and `bb`:
/// `(i, j)` such that `j` is among the `knn` nearest rows of `bb` to
/// `aa[i]`, and `i` is among the `knn` nearest rows of `aa` to `bb[j]`.
pub fn mutual_nearest_neighbours(
    aa: &DMatrix<f32>,
    bb: &DMatrix<f32>,
    knn: usize,
    block_size: usize,
) -> anyhow::Result<Vec<(usize, usize)>> {
    let a_to_b = knn_search(aa, bb, knn, false, block_size)?;
    let b_to_a = knn_search(bb, aa, knn, false, block_size)?;

    let mut pairs = vec![];
    for (i, nbrs) in a_to_b.iter().enumerate() {
        for &(j, _) in nbrs {
            if b_to_a[j].iter().any(|&(k, _)| k == i) {
                pairs.push((i, j));
            }
        }
    }
    pairs.sort_unstable();
    Ok(pairs)
}

/// Binary search for per-point sigma (UMAP's smooth_knn_dist).
///
/// Finds sigma such that: sum_j exp(-max(0, d_j - rho) / sigma) = target
pub fn smooth_knn_sigma(dists: &[f32], rho: f32, target: f32) -> f32 {
    const TOLERANCE: f32 = 1e-5;
    const MAX_ITER: usize = 64;

    let mean_dist: f32 = dists.iter().sum::<f32>() / dists.len().max(1) as f32;
    let min_sigma = (1e-3 * mean_dist).max(f32::MIN_POSITIVE);

    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut mid = 1.0f32;

    for _ in 0..MAX_ITER {
        let mut psum = 0.0f32;
        for &d in dists {
            let gap = d - rho;
            if gap > 0.0 {
                psum += (-gap / mid).exp();
            } else {
                psum += 1.0;
            }
        }

        if (psum - target).abs() < TOLERANCE {
            break;
        }

        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi.is_infinite() {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }

    mid.max(min_sigma)
}

/// Compute a single directed UMAP membership weight.
fn directed_umap_weight(d: f32, rho: f32, sigma: f32) -> f32 {
    if d.is_infinite() || sigma <= 0.0 {
        return 0.0;
    }
    let gap = d - rho;
    if gap <= 0.0 {
        1.0
    } else {
        (-gap / sigma).exp()
    }
}

pub fn median_f32(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

pub fn create_jobs(ntot: usize, block_size: usize) -> Vec<(usize, usize)> {
    let block_size = if block_size == 0 {
        DEFAULT_BLOCK_SIZE
    } else {
        block_size
    };
    let nblock = ntot.div_ceil(block_size);
    (0..nblock)
        .map(|block| {
            let lb = block * block_size;
            let ub = ((block + 1) * block_size).min(ntot);
            (lb, ub)
        })
        .collect()
}
