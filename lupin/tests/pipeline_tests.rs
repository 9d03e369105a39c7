use lupin::checkpoint::Checkpoint;
use lupin::config::PipelineConfig;
use lupin::error::PipelineError;
use lupin::expression::ExpressionMatrix;
use lupin::input::CountTable;
use lupin::metadata::{build_metadata, AnnotationTable, MetadataArgs};
use lupin::output::{output_file, write_pipeline_outputs};
use lupin::pca::PcaSolver;
use lupin::pipeline::{centiles_from_checkpoint, run_pipeline};
use lupin::qc::{qc_filter, QcPredicate, QcThresholds};

use matrix_util::common_io::{create_temp_dir_file, read_lines};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};

/// Poisson counts for donors × cells with three cell types, a
/// donor-specific gene block and one cell in six pushed over the total
/// count limit
struct Simulation {
    n_donors: usize,
    n_cells: usize,
    n_genes: usize,
    n_mito: usize,
    block: usize,
    seed: u64,
}

fn barcode(j: usize) -> String {
    let nt = ['A', 'C', 'G', 'T'];
    (0..6).map(|k| nt[(j >> (2 * k)) & 3]).collect()
}

fn poisson(rate: f64) -> anyhow::Result<Poisson<f64>> {
    Poisson::new(rate).map_err(|e| anyhow::anyhow!("poisson({}): {:?}", rate, e))
}

impl Simulation {
    fn is_high_total(&self, d: usize, j: usize) -> bool {
        (d * self.n_cells + j) % 6 == 5
    }

    fn cell_type(j: usize) -> usize {
        j % 3
    }

    fn generate(&self) -> anyhow::Result<CountTable> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let base = poisson(4.0)?;
        let marker = poisson(16.0)?;
        let donor = poisson(10.0)?;

        let genes: Vec<Box<str>> = (0..self.n_genes)
            .map(|g| {
                if g < self.n_mito {
                    format!("MT-ND{}", g + 1).into()
                } else {
                    format!("GENE{:04}", g).into()
                }
            })
            .collect();

        let mut cells = vec![];
        let mut triplets = vec![];

        for d in 0..self.n_donors {
            for j in 0..self.n_cells {
                let col = cells.len();
                cells.push(format!("D{}.{}.{}", d + 1, barcode(j), 1 + (j * 2) / self.n_cells).into_boxed_str());

                let type_lb = self.n_mito + self.block * Self::cell_type(j);
                let donor_lb = self.n_mito + 3 * self.block + (self.block / 2) * d;

                for g in 0..self.n_genes {
                    let mut x = if (type_lb..type_lb + self.block).contains(&g) {
                        marker.sample(&mut rng)
                    } else if (donor_lb..donor_lb + self.block / 2).contains(&g) {
                        donor.sample(&mut rng)
                    } else {
                        base.sample(&mut rng)
                    };
                    if g == self.n_mito && self.is_high_total(d, j) {
                        x += 150_000.0;
                    }
                    if x > 0.0 {
                        triplets.push((g, col, x as f32));
                    }
                }
            }
        }

        Ok(CountTable {
            genes,
            cells,
            triplets,
        })
    }

    /// cell type of every cell, keyed with dashes instead of dots
    fn annotation(&self) -> AnnotationTable {
        let mut rows = vec![];
        for d in 0..self.n_donors {
            for j in 0..self.n_cells {
                let key = format!("D{}-{}-{}", d + 1, barcode(j), 1 + (j * 2) / self.n_cells);
                let celltype = format!("type{}", Self::cell_type(j));
                rows.push((key.into_boxed_str(), vec![celltype.into_boxed_str()]));
            }
        }
        AnnotationTable {
            key_column: "cell".into(),
            columns: vec!["celltype".into()],
            rows,
        }
    }
}

fn small_simulation() -> Simulation {
    Simulation {
        n_donors: 2,
        n_cells: 150,
        n_genes: 120,
        n_mito: 5,
        block: 20,
        seed: 3,
    }
}

fn small_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.qc.min_features = 50;
    cfg.features.n_features = 80;
    cfg.pca.n_pcs = 10;
    cfg.integration.k_weight = 30;
    cfg.cluster.knn = 10;
    cfg.cluster.n_dims = 10;
    cfg.centile.genes = vec!["GENE0010".into(), "GENE0050".into()];
    cfg.centile.group_column = Some("celltype".into());
    cfg
}

#[test]
fn three_donor_scenario() -> anyhow::Result<()> {
    let sim = Simulation {
        n_donors: 3,
        n_cells: 1000,
        n_genes: 600,
        n_mito: 20,
        block: 40,
        seed: 1,
    };
    let table = sim.generate()?;
    assert_eq!(table.num_cells(), 3000);

    let mut cfg = PipelineConfig::default();
    cfg.pca.solver = PcaSolver::Randomized { seed: 7 };

    let state = run_pipeline(&table, None, &cfg)?;

    // every identifier parsed, one in six cells over the total count limit
    assert_eq!(state.qc.num_before(), 3000);
    assert_eq!(state.qc.num_retained(), 2500);
    assert_eq!(state.matrix.num_cells(), 2500);
    assert!(state.matrix.cell_metrics().iter().all(|m| (0.0..=100.0).contains(&m.percent_mito)));

    assert_eq!(state.partition.num_batches(), 3);
    let mut covered: Vec<usize> = vec![];
    for b in &state.partition.batches {
        assert!((833..=834).contains(&b.cells.len()), "{}: {}", b.name, b.cells.len());
        covered.extend(&b.cells);
    }
    covered.sort_unstable();
    assert_eq!(covered, (0..2500).collect::<Vec<_>>());

    // fewer genes than requested: all of them
    assert_eq!(state.features.num_selected(), 600);
    assert_eq!(state.matrix.num_genes(), 600);

    let integrated = state
        .registry
        .embedding(&state.integrated_key)
        .ok_or_else(|| anyhow::anyhow!("no integrated embedding"))?;
    assert_eq!(integrated.num_cells(), 2500);
    assert_eq!(integrated.cells, state.matrix.cells());
    assert_eq!(state.integration.order.len(), 3);
    assert_eq!(state.integration.pairs.len(), 3);
    assert!(state.integration.uncorrected_batches.is_empty());

    let clusters = &state.clusters;
    assert_eq!(clusters.resolution, 0.5);
    assert!(clusters.n_clusters >= 1);
    assert_eq!(clusters.labels.len(), 2500);
    assert!(clusters.labels.iter().all(|&k| k < clusters.n_clusters));
    assert_eq!(clusters.cluster_sizes().iter().sum::<usize>(), 2500);

    assert!(state.centiles.is_none());
    assert_eq!(state.registry.num_embeddings(), 2);
    assert_eq!(state.registry.num_clusterings(), 1);
    Ok(())
}

#[test]
fn same_input_same_state() -> anyhow::Result<()> {
    let sim = small_simulation();
    let table = sim.generate()?;
    let annotation = sim.annotation();
    let cfg = small_config();

    let a = run_pipeline(&table, Some(&annotation), &cfg)?;
    let b = run_pipeline(&table, Some(&annotation), &cfg)?;

    assert_eq!(a.matrix.num_cells(), 250);
    assert_eq!(a.clusters, b.clusters);
    assert_eq!(a.centiles, b.centiles);
    assert_eq!(a.registry, b.registry);

    let ja = serde_json::to_string(&a.checkpoint())?;
    let jb = serde_json::to_string(&b.checkpoint())?;
    assert_eq!(ja, jb);
    Ok(())
}

#[test]
fn outputs_and_checkpoint_reload() -> anyhow::Result<()> {
    let sim = small_simulation();
    let table = sim.generate()?;
    let annotation = sim.annotation();
    let mut cfg = small_config();
    cfg.projection.umap = true;
    cfg.projection.umap_epochs = 30;
    cfg.projection.umap_neighbours = 10;

    let state = run_pipeline(&table, Some(&annotation), &cfg)?;
    assert_eq!(state.registry.num_embeddings(), 3);

    let prefix = create_temp_dir_file(".run")?;
    let prefix = prefix.to_str().expect("utf-8 path");
    let files = write_pipeline_outputs(&state, prefix, "checkpoint.json.gz")?;

    for suffix in [
        "config.json",
        "qc.tsv",
        "features.tsv",
        "pca_variance.tsv",
        "integration.tsv",
        "clusters.tsv",
        "embedding.pca.tsv",
        "embedding.cca.tsv",
        "embedding.umap.tsv",
        "centile.tsv",
        "centile_counts.tsv",
        "centile_cells.tsv",
    ] {
        let file = output_file(prefix, suffix);
        assert!(files.contains(&file), "{} not written", file);
    }

    let clusters = read_lines(&output_file(prefix, "clusters.tsv"))?;
    assert_eq!(clusters.len(), 251);
    assert_eq!(clusters[0].as_ref(), "cell\tdonor\treplicate\tcluster");

    let qc = read_lines(&output_file(prefix, "qc.tsv"))?;
    assert_eq!(qc.len(), 301);

    let reloaded = PipelineConfig::from_json_file(&output_file(prefix, "config.json"))?;
    assert_eq!(reloaded, cfg);

    let checkpoint = Checkpoint::from_json_file(&output_file(prefix, "checkpoint.json.gz"))?;
    let (_, matrix, registry) = checkpoint.restore()?;
    assert_eq!(matrix, state.matrix);
    assert_eq!(registry, state.registry);

    let centiles = centiles_from_checkpoint(&checkpoint, &cfg.centile)?;
    assert_eq!(Some(centiles), state.centiles);
    Ok(())
}

#[test]
fn centiles_grouped_by_annotation() -> anyhow::Result<()> {
    let sim = small_simulation();
    let table = sim.generate()?;
    let state = run_pipeline(&table, Some(&sim.annotation()), &small_config())?;

    let centiles = state
        .centiles
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("centiles requested"))?;
    assert_eq!(centiles.group_column.as_ref(), "celltype");
    assert_eq!(centiles.num_cells(), 250);

    for gene in ["GENE0010", "GENE0050"] {
        let bins = centiles.centiles_of(gene)?;
        assert!(bins.iter().all(|&c| (1..=100).contains(&c)));
        assert_eq!(bins.iter().filter(|&&c| c == 100).count(), 3);
    }

    // GENE0010 marks type0 and GENE0050 marks type2
    let top = centiles.group_counts("GENE0010", 95)?;
    let n_top: usize = top.values().sum();
    assert!(top.get("type0").copied().unwrap_or(0) * 2 > n_top);
    let top = centiles.group_counts("GENE0050", 95)?;
    let n_top: usize = top.values().sum();
    assert!(top.get("type2").copied().unwrap_or(0) * 2 > n_top);
    Ok(())
}

#[test]
fn stage_errors_surface_typed() -> anyhow::Result<()> {
    let sim = small_simulation();
    let mut table = sim.generate()?;

    let mut cfg = small_config();
    cfg.qc.min_features = 10_000;
    let err = run_pipeline(&table, None, &cfg).err().expect("nothing passes QC");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::EmptyAfterFilter { before: 300, .. })
    ));

    table.cells[7] = "D1_ACGT_1".into();
    let err = run_pipeline(&table, None, &small_config()).err().expect("bad identifier");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MalformedIdentifier { position: 7, .. })
    ));

    let mut cfg = PipelineConfig::default();
    cfg.qc.min_features = 50;
    cfg.centile.genes = vec!["NOT_A_GENE".into()];
    let err = run_pipeline(&sim.generate()?, None, &cfg).err().expect("unknown gene");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::UnknownGene(_))
    ));
    Ok(())
}

#[test]
fn qc_drops_cells_on_every_boundary() -> anyhow::Result<()> {
    let genes: Vec<Box<str>> = (0..600)
        .map(|g| {
            if g < 20 {
                format!("MT-CO{}", g).into()
            } else {
                format!("GENE{:04}", g).into()
            }
        })
        .collect();
    let cells: Vec<Box<str>> = ["D1.AAAA.1", "D1.CCCC.1", "D1.GGGG.1", "D1.TTTT.1", "D1.ACGT.1"]
        .iter()
        .map(|&c| c.into())
        .collect();
    let meta = build_metadata(&cells, None, &MetadataArgs::default())?;

    let mut trip = vec![];
    // exactly 500 detected features
    trip.extend((20..520).map(|g| (g, 0, 1.0)));
    // 150 mitochondrial of 1000 counts, 510 features
    trip.extend((0..10).map(|g| (g, 1, 15.0)));
    trip.extend((20..520).map(|g| (g, 1, if g < 370 { 2.0 } else { 1.0 })));
    // exactly 100000 counts over 501 features
    trip.extend((20..520).map(|g| (g, 2, 1.0)));
    trip.push((520, 2, 99_500.0));
    // just inside every bound
    trip.extend((20..520).map(|g| (g, 3, 1.0)));
    trip.push((520, 3, 99_499.0));
    // plain cell
    trip.extend((20..521).map(|g| (g, 4, 1.0)));

    let matrix = ExpressionMatrix::from_triplets(genes, meta, &trip, "MT-")?;
    let metrics = matrix.cell_metrics();
    assert_eq!(metrics[0].detected_features, 500);
    assert_eq!(metrics[1].total_count, 1000.0);
    assert_eq!(metrics[2].total_count, 100_000.0);

    let out = qc_filter(&matrix, &QcThresholds::default())?;

    let expected: Vec<Box<str>> = vec!["D1.TTTT.1".into(), "D1.ACGT.1".into()];
    assert_eq!(out.matrix.cells(), expected);

    let report = &out.report;
    assert_eq!(report.num_before(), 5);
    assert_eq!(report.num_retained(), 2);
    assert_eq!(report.records[0].failed, vec![QcPredicate::MinFeatures]);
    assert_eq!(report.records[1].failed, vec![QcPredicate::MaxPercentMito]);
    assert_eq!(report.records[2].failed, vec![QcPredicate::MaxTotalCount]);
    assert!(report.records[3].retained());
    assert!(report.records[4].retained());

    let lines = report.to_lines();
    assert_eq!(lines.len(), 6);
    assert!(lines[1].starts_with("D1.AAAA.1\t") && lines[1].ends_with("\tfalse\tdetected_features"));
    assert!(lines[3].ends_with("\tfalse\ttotal_count"));
    assert!(lines[4].ends_with("\ttrue\t."));
    Ok(())
}
