use lupin::batch::partition_by_donor;
use lupin::centile::{compute_centiles, resolve_groups};
use lupin::error::PipelineError;
use lupin::expression::ExpressionMatrix;
use lupin::metadata::{build_metadata, AnnotationTable, MetadataArgs};
use lupin::normalize::{normalize_batches, NormalizeArgs};

fn barcode(j: usize) -> String {
    let nt = ['A', 'C', 'G', 'T'];
    (0..5).map(|k| nt[(j >> (2 * k)) & 3]).collect()
}

/// 100 cells of one donor; `G` counts are `values`, `HOUSE` is constant
fn matrix_with(values: &[f32]) -> anyhow::Result<ExpressionMatrix> {
    let n = values.len();
    let cells: Vec<Box<str>> = (0..n).map(|j| format!("D1.{}.1", barcode(j)).into()).collect();

    let rows = cells
        .iter()
        .enumerate()
        .map(|(j, c)| {
            let stage = if j < n / 2 { "early" } else { "late" };
            (c.replace('.', "_").into_boxed_str(), vec![stage.into()])
        })
        .collect();
    let annotation = AnnotationTable {
        key_column: "cell".into(),
        columns: vec!["stage".into()],
        rows,
    };
    let meta = build_metadata(&cells, Some(&annotation), &MetadataArgs::default())?;

    let genes: Vec<Box<str>> = vec!["G".into(), "HOUSE".into()];
    let mut trip = vec![];
    for (j, &v) in values.iter().enumerate() {
        trip.push((0, j, v));
        trip.push((1, j, 1000.0));
    }
    ExpressionMatrix::from_triplets(genes, meta, &trip, "MT-")
}

#[test]
fn one_to_hundred_top_five() -> anyhow::Result<()> {
    let values: Vec<f32> = (1..=100).map(|v| v as f32).collect();
    let matrix = matrix_with(&values)?;
    let partition = partition_by_donor(&matrix)?;
    let normalized = normalize_batches(&matrix, &partition, &NormalizeArgs::default())?;

    let (col, groups) = resolve_groups(&matrix, Some("stage"), None)?;
    let table = compute_centiles(&matrix, &normalized.data, &["G".into()], &col, groups)?;

    let bins = table.centiles_of("G")?;
    assert_eq!(bins[99], 100);
    let mut sorted = bins.to_vec();
    sorted.sort_unstable();
    assert_eq!(sorted, (1..=100).collect::<Vec<u8>>());

    let top = table.crossing("G", 95)?;
    assert_eq!(top, vec![95, 96, 97, 98, 99]);

    // values 96..100 sit in the second half
    let counts = table.group_counts("G", 95)?;
    assert_eq!(counts.get("late"), Some(&5));
    assert_eq!(counts.get("early"), None);
    Ok(())
}

#[test]
fn equal_values_rank_by_identifier() -> anyhow::Result<()> {
    let matrix = matrix_with(&[3.0; 100])?;
    let partition = partition_by_donor(&matrix)?;
    let normalized = normalize_batches(&matrix, &partition, &NormalizeArgs::default())?;

    let (col, groups) = resolve_groups(&matrix, None, None)?;
    let table = compute_centiles(&matrix, &normalized.data, &["G".into()], &col, groups)?;
    let bins = table.centiles_of("G")?;

    let cells = matrix.cells();
    let mut by_id: Vec<usize> = (0..cells.len()).collect();
    by_id.sort_by(|&a, &b| cells[a].cmp(&cells[b]));
    for (r, &j) in by_id.iter().enumerate() {
        assert_eq!(bins[j] as usize, r + 1);
    }
    assert!(table.groups.iter().all(|g| g.as_ref() == "NA"));
    Ok(())
}

#[test]
fn unknown_gene_and_column() -> anyhow::Result<()> {
    let values: Vec<f32> = (1..=100).map(|v| v as f32).collect();
    let matrix = matrix_with(&values)?;
    let partition = partition_by_donor(&matrix)?;
    let normalized = normalize_batches(&matrix, &partition, &NormalizeArgs::default())?;

    assert!(resolve_groups(&matrix, Some("tissue"), None).is_err());

    let (col, groups) = resolve_groups(&matrix, Some("stage"), None)?;
    let err = compute_centiles(&matrix, &normalized.data, &["CD3E".into()], &col, groups)
        .err()
        .expect("unknown gene");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::UnknownGene(g)) if g.as_ref() == "CD3E"
    ));
    Ok(())
}
