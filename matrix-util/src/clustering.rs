//! Seeded Louvain community detection on weighted undirected graphs

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const TOLERANCE: f64 = 1e-10;

/// Weighted undirected graph in adjacency-list form.
///
/// `A[i][j] = A[j][i] = w` for every edge; self-loops carry their
/// weight once on the diagonal. Node strength `k_i = sum_j A[i][j]`.
pub struct WeightedGraph {
    n_nodes: usize,
    adj: Vec<Vec<(usize, f64)>>,
    self_loops: Vec<f64>,
    strength: Vec<f64>,
    total: f64,
}

impl WeightedGraph {
    /// Build from `(i, j, w)` edges; duplicate pairs are summed
    pub fn from_edges(n_nodes: usize, edges: &[(usize, usize, f32)]) -> anyhow::Result<Self> {
        let mut adj: Vec<Vec<(usize, f64)>> = vec![vec![]; n_nodes];
        let mut self_loops = vec![0.0; n_nodes];

        for &(i, j, w) in edges {
            if i >= n_nodes || j >= n_nodes {
                anyhow::bail!("edge ({}, {}) outside of {} nodes", i, j, n_nodes);
            }
            if !w.is_finite() || w < 0.0 {
                anyhow::bail!("invalid weight {} on edge ({}, {})", w, i, j);
            }
            if i == j {
                self_loops[i] += w as f64;
            } else {
                adj[i].push((j, w as f64));
                adj[j].push((i, w as f64));
            }
        }

        for nbrs in adj.iter_mut() {
            nbrs.sort_by_key(|&(j, _)| j);
            let mut merged: Vec<(usize, f64)> = Vec::with_capacity(nbrs.len());
            for &(j, w) in nbrs.iter() {
                match merged.last_mut() {
                    Some(last) if last.0 == j => last.1 += w,
                    _ => merged.push((j, w)),
                }
            }
            *nbrs = merged;
        }

        Ok(Self::from_parts(adj, self_loops))
    }

    fn from_parts(adj: Vec<Vec<(usize, f64)>>, self_loops: Vec<f64>) -> Self {
        let strength: Vec<f64> = adj
            .iter()
            .zip(self_loops.iter())
            .map(|(nbrs, &s)| s + nbrs.iter().map(|&(_, w)| w).sum::<f64>())
            .collect();
        let total = strength.iter().sum();
        WeightedGraph {
            n_nodes: adj.len(),
            adj,
            self_loops,
            strength,
            total,
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Sum of all node strengths (twice the off-diagonal edge weight)
    pub fn total_strength(&self) -> f64 {
        self.total
    }

    /// Collapse communities into single nodes
    fn aggregate(&self, membership: &[usize], n_comm: usize) -> Self {
        let mut self_loops = vec![0.0; n_comm];
        let mut acc: Vec<fnv::FnvHashMap<usize, f64>> = vec![Default::default(); n_comm];

        for i in 0..self.n_nodes {
            let ci = membership[i];
            self_loops[ci] += self.self_loops[i];
            for &(j, w) in &self.adj[i] {
                let cj = membership[j];
                if ci == cj {
                    self_loops[ci] += w;
                } else {
                    *acc[ci].entry(cj).or_default() += w;
                }
            }
        }

        let adj = acc
            .into_iter()
            .map(|m| {
                let mut nbrs: Vec<(usize, f64)> = m.into_iter().collect();
                nbrs.sort_by_key(|&(j, _)| j);
                nbrs
            })
            .collect();

        Self::from_parts(adj, self_loops)
    }
}

pub struct LouvainArgs {
    pub resolution: f64,
    pub seed: u64,
    pub max_levels: usize,
    pub max_sweeps: usize,
}

impl Default for LouvainArgs {
    fn default() -> Self {
        LouvainArgs {
            resolution: 1.0,
            seed: 42,
            max_levels: 100,
            max_sweeps: 1000,
        }
    }
}

/// Louvain result: size-ordered labels (0 = largest) and the
/// modularity of that partition on the input graph
pub struct LouvainOut {
    pub membership: Vec<usize>,
    pub modularity: f64,
    pub levels: usize,
}

/// Run multi-level Louvain optimisation of
/// `Q = 1/2m sum_ij [A_ij - γ k_i k_j / 2m] δ(c_i, c_j)`.
///
/// Node visiting order is shuffled with a `StdRng` seeded from
/// `args.seed`, so identical inputs produce identical labels.
pub fn louvain(graph: &WeightedGraph, args: &LouvainArgs) -> anyhow::Result<LouvainOut> {
    let nn = graph.num_nodes();
    if nn == 0 {
        anyhow::bail!("empty graph");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut membership: Vec<usize> = (0..nn).collect();

    let q0 = modularity(graph, &membership, args.resolution);
    info!("louvain starting modularity: {:.6}", q0);

    let mut levels = 0;
    let mut current: Option<WeightedGraph> = None;

    while levels < args.max_levels {
        let g = current.as_ref().unwrap_or(graph);
        let (local, n_comm, moved) = one_level(g, args, &mut rng);

        if !moved {
            break;
        }

        for c in membership.iter_mut() {
            *c = local[*c];
        }
        levels += 1;

        debug!("level {}: {} -> {} communities", levels, g.num_nodes(), n_comm);

        if n_comm == g.num_nodes() {
            break;
        }
        let next = g.aggregate(&local, n_comm);
        current = Some(next);
    }

    let membership = relabel_by_size(&membership);
    let q = modularity(graph, &membership, args.resolution);
    info!("louvain optimized in {} levels, modularity: {:.6}", levels, q);

    Ok(LouvainOut {
        membership,
        modularity: q,
        levels,
    })
}

/// Local moving phase; returns compact community ids in order of
/// first appearance, the number of communities, and whether any node
/// moved.
fn one_level(graph: &WeightedGraph, args: &LouvainArgs, rng: &mut StdRng) -> (Vec<usize>, usize, bool) {
    let nn = graph.num_nodes();
    let m2 = graph.total_strength();
    let gamma = args.resolution;

    let mut comm: Vec<usize> = (0..nn).collect();
    let mut tot: Vec<f64> = graph.strength.clone();

    if m2 <= 0.0 {
        return (comm, nn, false);
    }

    let mut order: Vec<usize> = (0..nn).collect();
    order.shuffle(rng);

    let mut neigh_weight = vec![0.0f64; nn];
    let mut neigh_comms: Vec<usize> = Vec::with_capacity(nn);
    let mut any_move = false;

    for _ in 0..args.max_sweeps {
        let mut n_moves = 0;

        for &i in &order {
            let ci = comm[i];
            let ki = graph.strength[i];

            for &c in &neigh_comms {
                neigh_weight[c] = 0.0;
            }
            neigh_comms.clear();
            neigh_comms.push(ci);

            for &(j, w) in &graph.adj[i] {
                let cj = comm[j];
                if neigh_weight[cj] == 0.0 && !neigh_comms.contains(&cj) {
                    neigh_comms.push(cj);
                }
                neigh_weight[cj] += w;
            }

            tot[ci] -= ki;

            let gain = |c: usize| neigh_weight[c] - gamma * tot[c] * ki / m2;

            let mut best = ci;
            let mut best_gain = gain(ci);
            for &c in neigh_comms.iter().skip(1) {
                let g = gain(c);
                if g > best_gain + TOLERANCE {
                    best = c;
                    best_gain = g;
                }
            }

            tot[best] += ki;
            if best != ci {
                comm[i] = best;
                n_moves += 1;
            }
        }

        if n_moves == 0 {
            break;
        }
        any_move = true;
    }

    let mut remap = vec![usize::MAX; nn];
    let mut n_comm = 0;
    for c in comm.iter_mut() {
        if remap[*c] == usize::MAX {
            remap[*c] = n_comm;
            n_comm += 1;
        }
        *c = remap[*c];
    }

    (comm, n_comm, any_move)
}

/// Newman-Girvan modularity with resolution `γ`
pub fn modularity(graph: &WeightedGraph, membership: &[usize], resolution: f64) -> f64 {
    let m2 = graph.total_strength();
    if m2 <= 0.0 {
        return 0.0;
    }

    let n_comm = membership.iter().copied().max().map(|x| x + 1).unwrap_or(0);
    let mut internal = vec![0.0f64; n_comm];
    let mut tot = vec![0.0f64; n_comm];

    for i in 0..graph.num_nodes() {
        let ci = membership[i];
        tot[ci] += graph.strength[i];
        internal[ci] += graph.self_loops[i];
        for &(j, w) in &graph.adj[i] {
            if membership[j] == ci {
                internal[ci] += w;
            }
        }
    }

    internal
        .iter()
        .zip(tot.iter())
        .map(|(&a, &t)| a / m2 - resolution * (t / m2) * (t / m2))
        .sum()
}

/// Relabel so that the largest cluster becomes 0, the next 1, and so
/// on; equal sizes keep the order in which labels first appear.
pub fn relabel_by_size(labels: &[usize]) -> Vec<usize> {
    let n_label = labels.iter().copied().max().map(|x| x + 1).unwrap_or(0);
    let mut size = vec![0usize; n_label];
    let mut first = vec![usize::MAX; n_label];
    for (i, &k) in labels.iter().enumerate() {
        size[k] += 1;
        first[k] = first[k].min(i);
    }

    let mut present: Vec<usize> = (0..n_label).filter(|&k| size[k] > 0).collect();
    present.sort_by(|&a, &b| size[b].cmp(&size[a]).then(first[a].cmp(&first[b])));

    let mut new_label = vec![0usize; n_label];
    for (rank, &k) in present.iter().enumerate() {
        new_label[k] = rank;
    }
    labels.iter().map(|&k| new_label[k]).collect()
}

/// Count members per cluster label
pub fn cluster_sizes(membership: &[usize]) -> Vec<usize> {
    let k = membership.iter().copied().max().map(|x| x + 1).unwrap_or(0);
    let mut sizes = vec![0usize; k];
    for &c in membership {
        sizes[c] += 1;
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Two 5-cliques joined by a single bridge edge
    fn two_cliques() -> Vec<(usize, usize, f32)> {
        let mut edges = vec![];
        for base in [0, 5] {
            for i in 0..5 {
                for j in (i + 1)..5 {
                    edges.push((base + i, base + j, 1.0));
                }
            }
        }
        edges.push((4, 5, 1.0));
        edges
    }

    #[test]
    fn test_two_cliques_split() -> anyhow::Result<()> {
        let graph = WeightedGraph::from_edges(10, &two_cliques())?;
        let out = louvain(&graph, &LouvainArgs::default())?;

        assert_eq!(cluster_sizes(&out.membership), vec![5, 5]);
        assert!(out.membership[..5].iter().all(|&c| c == out.membership[0]));
        assert!(out.membership[5..].iter().all(|&c| c == out.membership[5]));
        assert_ne!(out.membership[0], out.membership[5]);
        assert!(out.modularity > 0.3);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_labels() -> anyhow::Result<()> {
        let graph = WeightedGraph::from_edges(10, &two_cliques())?;
        let args = LouvainArgs {
            seed: 7,
            ..Default::default()
        };
        let a = louvain(&graph, &args)?;
        let b = louvain(&graph, &args)?;
        assert_eq!(a.membership, b.membership);
        assert_eq!(a.modularity, b.modularity);
        Ok(())
    }

    #[test]
    fn test_modularity_known_partition() -> anyhow::Result<()> {
        // single edge, both endpoints together: Q = 1 - 1 = 0
        let graph = WeightedGraph::from_edges(2, &[(0, 1, 1.0)])?;
        assert_abs_diff_eq!(modularity(&graph, &[0, 0], 1.0), 0.0, epsilon = 1e-12);
        // split: Q = 0 - 2 * (1/2)^2 = -0.5
        assert_abs_diff_eq!(modularity(&graph, &[0, 1], 1.0), -0.5, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_aggregation_preserves_modularity() -> anyhow::Result<()> {
        let graph = WeightedGraph::from_edges(10, &two_cliques())?;
        let membership = vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1];
        let coarse = graph.aggregate(&membership, 2);
        assert_abs_diff_eq!(coarse.total_strength(), graph.total_strength(), epsilon = 1e-9);
        assert_abs_diff_eq!(
            modularity(&coarse, &[0, 1], 1.0),
            modularity(&graph, &membership, 1.0),
            epsilon = 1e-9
        );
        Ok(())
    }

    #[test]
    fn test_relabel_by_size() {
        let labels = vec![3, 3, 1, 2, 2, 2, 1];
        assert_eq!(relabel_by_size(&labels), vec![1, 1, 2, 0, 0, 0, 2]);
    }

    #[test]
    fn test_invalid_edges() {
        assert!(WeightedGraph::from_edges(2, &[(0, 2, 1.0)]).is_err());
        assert!(WeightedGraph::from_edges(2, &[(0, 1, -1.0)]).is_err());
    }
}
