use crate::batch::BatchPartition;
use crate::common::*;
use crate::embedding::{Embedding, EmbeddingKey, EmbeddingMethod, Scope};

use matrix_util::dmatrix_util::select_rows;
use matrix_util::knn_graph::{knn_search, mutual_nearest_neighbours};
use matrix_util::traits::{MatOps, RowOps};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct IntegrationArgs {
    /// canonical components used to find anchors (capped by the
    /// embedding dimension)
    pub cca_rank: usize,
    /// a batch pair needs at least this many non-degenerate canonical
    /// directions
    pub min_cca_rank: usize,
    /// neighbours searched when pairing anchor cells
    pub k_anchor: usize,
    /// anchors averaged per corrected cell
    pub k_weight: usize,
    /// keep going when a batch cannot be aligned
    pub tolerate_partial: bool,
    pub block_size: usize,
}

impl Default for IntegrationArgs {
    fn default() -> Self {
        IntegrationArgs {
            cca_rank: 15,
            min_cca_rank: 2,
            k_anchor: 5,
            k_weight: 100,
            tolerate_partial: false,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PairSummary {
    pub batch_a: Box<str>,
    pub batch_b: Box<str>,
    /// numerical rank of the cross-batch covariance
    pub rank: usize,
    pub n_anchors: usize,
    /// leading singular values of the scaled cross product
    pub singular_values: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct IntegrationReport {
    /// reference first, then the order corrections were applied
    pub order: Vec<Box<str>>,
    pub pairs: Vec<PairSummary>,
    pub failures: Vec<PipelineError>,
    pub uncorrected_batches: Vec<Box<str>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntegrationResult {
    pub embedding: Embedding,
    pub report: IntegrationReport,
}

/// Anchors between two batches as local cell positions `(a, b)`
struct PairAnchors {
    rank: usize,
    singular_values: Vec<f32>,
    anchors: Vec<(usize, usize)>,
}

/// Batches by descending size, ties by name. The first one is the
/// reference.
pub fn integration_order(partition: &BatchPartition) -> Vec<usize> {
    let mut order: Vec<usize> = (0..partition.num_batches()).collect();
    order.sort_by(|&a, &b| {
        let (ba, bb) = (&partition.batches[a], &partition.batches[b]);
        bb.cells
            .len()
            .cmp(&ba.cells.len())
            .then_with(|| ba.name.cmp(&bb.name))
    });
    order
}

/// Canonical cell vectors of two batches.
///
/// With `A = Qa Ra` and `B = Qb Rb`, the left and right singular
/// vectors of `A Bᵀ` are `Qa U` and `Qb V` where `Ra Rbᵀ = U S Vᵀ`.
/// Returns `(rank, singular values, ua, vb)` with unit-length rows.
fn canonical_vectors(aa: &Mat, bb: &Mat, args: &IntegrationArgs) -> (usize, Vec<f32>, Mat, Mat) {
    let qr_a = aa.scale_columns().qr();
    let qr_b = bb.scale_columns().qr();
    let (qa, ra) = (qr_a.q(), qr_a.r());
    let (qb, rb) = (qr_b.q(), qr_b.r());

    let svd = (&ra * rb.transpose()).svd(true, true);
    let (u, v) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t.transpose()),
        _ => return (0, vec![], Mat::zeros(0, 0), Mat::zeros(0, 0)),
    };
    let sigma = svd.singular_values;

    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|&x, &y| sigma[y].total_cmp(&sigma[x]).then(x.cmp(&y)));

    let top = order.first().map(|&k| sigma[k]).unwrap_or(0.0);
    let rank = if top > 0.0 {
        order.iter().filter(|&&k| sigma[k] > top * 1e-6).count()
    } else {
        0
    };

    order.truncate(args.cca_rank.min(rank));
    let mut ua = &qa * u.select_columns(&order);
    let mut vb = &qb * v.select_columns(&order);
    ua.normalize_rows_inplace();
    vb.normalize_rows_inplace();

    (rank, order.iter().map(|&k| sigma[k]).collect(), ua, vb)
}

fn find_pair_anchors(
    name_a: &str,
    aa: &Mat,
    name_b: &str,
    bb: &Mat,
    args: &IntegrationArgs,
) -> anyhow::Result<PairAnchors> {
    let (rank, singular_values, ua, vb) = canonical_vectors(aa, bb, args);

    if rank < args.min_cca_rank {
        return Err(PipelineError::InsufficientOverlap {
            batch_a: name_a.into(),
            batch_b: name_b.into(),
            reason: format!("canonical rank {} < {}", rank, args.min_cca_rank).into(),
        }
        .into());
    }

    let anchors = mutual_nearest_neighbours(&ua, &vb, args.k_anchor, args.block_size)?;
    if anchors.is_empty() {
        return Err(PipelineError::InsufficientOverlap {
            batch_a: name_a.into(),
            batch_b: name_b.into(),
            reason: "no mutual nearest neighbours".into(),
        }
        .into());
    }

    debug!(
        "{} ~ {}: rank {}, {} anchors",
        name_a,
        name_b,
        rank,
        anchors.len()
    );

    Ok(PairAnchors {
        rank,
        singular_values,
        anchors,
    })
}

/// Normalized anchor weights from the sorted distances of one cell to
/// its nearest anchors, `w = 1 - exp(-(1 - d / d_max) / 4)`. Falls back
/// to equal weights when every raw weight vanishes.
pub fn anchor_weights(distances: &[f32]) -> Vec<f32> {
    if distances.is_empty() {
        return vec![];
    }
    let d_max = distances.iter().cloned().fold(0.0f32, f32::max);
    let raw: Vec<f32> = distances
        .iter()
        .map(|&d| {
            if d_max > 0.0 {
                1.0 - (-(1.0 - d / d_max) / 4.0).exp()
            } else {
                0.0
            }
        })
        .collect();
    let tot: f32 = raw.iter().sum();
    if tot > 0.0 {
        raw.iter().map(|w| w / tot).collect()
    } else {
        vec![1.0 / distances.len() as f32; distances.len()]
    }
}

/// Move the `query` cells of `pca` by weighted anchor corrections and
/// write them into `integrated`. Anchors are global `(reference, query)`
/// cell positions; the reference side is read from `integrated`.
fn correct_batch(
    pca: &Mat,
    integrated: &mut Mat,
    query: &[usize],
    anchors: &[(usize, usize)],
    args: &IntegrationArgs,
) -> anyhow::Result<()> {
    let dd = pca.ncols();
    let corrections = Mat::from_fn(anchors.len(), dd, |k, c| {
        integrated[(anchors[k].0, c)] - pca[(anchors[k].1, c)]
    });

    let anchor_cells: Vec<usize> = anchors.iter().map(|&(_, q)| q).collect();
    let query_rows = select_rows(pca, query);
    let anchor_rows = select_rows(pca, &anchor_cells);
    let kk = args.k_weight.min(anchors.len()).max(1);
    let nbrs = knn_search(&query_rows, &anchor_rows, kk, false, args.block_size)?;

    for (&x, list) in query.iter().zip(nbrs.iter()) {
        let dist: Vec<f32> = list.iter().map(|&(_, d)| d).collect();
        let weights = anchor_weights(&dist);
        for c in 0..dd {
            let delta: f32 = list
                .iter()
                .zip(weights.iter())
                .map(|(&(k, _), w)| w * corrections[(k, c)])
                .sum();
            integrated[(x, c)] = pca[(x, c)] + delta;
        }
    }
    Ok(())
}

/// Align every batch of `pca` into one shared space.
///
/// Canonical anchors are computed for all batch pairs in parallel. The
/// corrections are then applied one batch at a time in
/// `integration_order`, each toward the batches integrated before it.
pub fn integrate_batches(
    pca: &Embedding,
    partition: &BatchPartition,
    args: &IntegrationArgs,
) -> anyhow::Result<IntegrationResult> {
    if pca.num_cells() != partition.num_cells {
        return Err(PipelineError::DimensionMismatch {
            what: "integration input".into(),
            expected: format!("{} cells", partition.num_cells).into(),
            found: format!("{} cells", pca.num_cells()).into(),
        }
        .into());
    }
    partition.check_cover()?;

    let order = integration_order(partition);
    let names: Vec<Box<str>> = order
        .iter()
        .map(|&b| partition.batches[b].name.clone())
        .collect();

    let key = EmbeddingKey::new(
        EmbeddingMethod::Cca,
        Scope::Integrated,
        &[
            ("input", pca.key.to_string()),
            ("cca_rank", args.cca_rank.to_string()),
            ("min_cca_rank", args.min_cca_rank.to_string()),
            ("k_anchor", args.k_anchor.to_string()),
            ("k_weight", args.k_weight.to_string()),
        ],
    );

    let mut report = IntegrationReport {
        order: names.clone(),
        ..Default::default()
    };
    let coords = &pca.coords;
    let mut integrated = coords.clone();

    info!(
        "integrating {} batches in order: {}",
        order.len(),
        names.iter().map(|n| n.as_ref()).collect::<Vec<_>>().join(", ")
    );

    if order.len() > 1 {
        let batch_rows: Vec<Mat> = order
            .iter()
            .map(|&b| select_rows(coords, &partition.batches[b].cells))
            .collect();

        let pairs: Vec<(usize, usize)> = (1..order.len())
            .flat_map(|t| (0..t).map(move |s| (s, t)))
            .collect();

        let results: Vec<anyhow::Result<PairAnchors>> = pairs
            .par_iter()
            .map(|&(s, t)| {
                find_pair_anchors(&names[s], &batch_rows[s], &names[t], &batch_rows[t], args)
            })
            .collect();

        let mut anchors_of: Vec<Vec<(usize, PairAnchors)>> = (0..order.len()).map(|_| vec![]).collect();
        for (&(s, t), res) in pairs.iter().zip(results) {
            match res {
                Ok(found) => {
                    report.pairs.push(PairSummary {
                        batch_a: names[s].clone(),
                        batch_b: names[t].clone(),
                        rank: found.rank,
                        n_anchors: found.anchors.len(),
                        singular_values: found.singular_values.clone(),
                    });
                    anchors_of[t].push((s, found));
                }
                Err(err) => match err.downcast_ref::<PipelineError>().cloned() {
                    Some(failure @ PipelineError::InsufficientOverlap { .. }) if args.tolerate_partial => {
                        warn!("{}", failure);
                        report.failures.push(failure);
                    }
                    _ => return Err(err),
                },
            }
        }

        let mut done = vec![false; order.len()];
        done[0] = true;

        for t in 1..order.len() {
            let query = &partition.batches[order[t]].cells;
            let mut anchors = vec![];
            for (s, found) in &anchors_of[t] {
                if !done[*s] {
                    continue;
                }
                let reference = &partition.batches[order[*s]].cells;
                anchors.extend(found.anchors.iter().map(|&(i, j)| (reference[i], query[j])));
            }

            if anchors.is_empty() {
                if !args.tolerate_partial {
                    return Err(PipelineError::InsufficientOverlap {
                        batch_a: names[0].clone(),
                        batch_b: names[t].clone(),
                        reason: "no anchors to any integrated batch".into(),
                    }
                    .into());
                }
                warn!("batch {} left uncorrected", names[t]);
                report.uncorrected_batches.push(names[t].clone());
                continue;
            }

            correct_batch(coords, &mut integrated, query, &anchors, args)?;
            done[t] = true;
            info!("corrected batch {} with {} anchors", names[t], anchors.len());
        }
    }

    let embedding = Embedding::new(
        key,
        pca.cells.clone(),
        Embedding::component_names("IPC", pca.num_components()),
        integrated,
    )?;

    Ok(IntegrationResult { embedding, report })
}
