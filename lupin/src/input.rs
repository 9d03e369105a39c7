use crate::common::*;
use crate::metadata::AnnotationTable;

use matrix_util::common_io::{delimiter_for, read_lines_of_words_delim, read_lines_of_words_generic};

/// Gene-by-cell counts as read from a delimited table
#[derive(Clone, Debug, PartialEq, Default)]
pub struct CountTable {
    pub genes: Vec<Box<str>>,
    pub cells: Vec<Box<str>>,
    /// `(gene, cell, count)` of the non-zero entries
    pub triplets: Vec<(usize, usize, f32)>,
}

impl CountTable {
    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }
}

type GeneRow = (Box<str>, Vec<f32>);

/// Read a gene × cell count table.
///
/// The header row lists cell identifiers; it may carry one extra
/// leading field (a label for the gene column), which is dropped. Every
/// data row is a gene symbol followed by one count per cell. Columns
/// are comma separated for `.csv[.gz]` and tab separated otherwise.
pub fn read_count_table(file: &str) -> anyhow::Result<CountTable> {
    let delim = delimiter_for(file);

    let split_header =
        |line: &str| -> Vec<Box<str>> { delim.split(line).map(|x| x.trim().into()).collect() };

    let parse_row = |line_no: usize, line: &str| -> anyhow::Result<Vec<GeneRow>> {
        let mut words = delim.split(line).map(|x| x.trim());
        let gene: Box<str> = words
            .next()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| anyhow::anyhow!("{}:{}: missing gene symbol", file, line_no))?
            .into();
        let values = words
            .enumerate()
            .map(|(k, w)| {
                w.parse::<f32>().map_err(|_| {
                    anyhow::anyhow!(
                        "{}:{}: non-numeric value `{}` in column {} (gene {})",
                        file,
                        line_no,
                        w,
                        k + 2,
                        gene
                    )
                })
            })
            .collect::<anyhow::Result<Vec<f32>>>()?;
        Ok(vec![(gene, values)])
    };

    let out = read_lines_of_words_generic(file, 0, split_header, parse_row)?;
    let rows: Vec<GeneRow> = out.lines.into_iter().flatten().collect();

    let width = rows.first().map(|(_, v)| v.len()).unwrap_or(0);
    let mut header = out.header;
    if header.len() == width + 1 {
        header.remove(0);
    }
    if header.len() != width {
        return Err(PipelineError::DimensionMismatch {
            what: format!("{} header", file).into(),
            expected: format!("{} cell identifiers", width).into(),
            found: format!("{} fields", header.len()).into(),
        }
        .into());
    }

    let mut genes = Vec::with_capacity(rows.len());
    let mut triplets = vec![];
    for (g, (gene, values)) in rows.into_iter().enumerate() {
        if values.len() != width {
            return Err(PipelineError::DimensionMismatch {
                what: format!("{}: gene {}", file, gene).into(),
                expected: format!("{} values", width).into(),
                found: format!("{} values", values.len()).into(),
            }
            .into());
        }
        triplets.extend(
            values
                .into_iter()
                .enumerate()
                .filter(|&(_, v)| v != 0.0)
                .map(|(j, v)| (g, j, v)),
        );
        genes.push(gene);
    }

    info!(
        "read {} genes × {} cells ({} non-zero) from {}",
        genes.len(),
        header.len(),
        triplets.len(),
        file
    );

    Ok(CountTable {
        genes,
        cells: header,
        triplets,
    })
}

/// Read a delimited annotation table whose first column is the cell key
pub fn read_annotation_table(file: &str) -> anyhow::Result<AnnotationTable> {
    let out = read_lines_of_words_delim(file, delimiter_for(file), 0)?;

    let mut header = out.header.into_iter();
    let key_column = header
        .next()
        .ok_or_else(|| anyhow::anyhow!("{}: empty header", file))?;
    let columns: Vec<Box<str>> = header.collect();

    let mut rows = Vec::with_capacity(out.lines.len());
    for (i, words) in out.lines.into_iter().enumerate() {
        let mut words = words.into_iter();
        let key = match words.next() {
            Some(k) if !k.is_empty() => k,
            _ => anyhow::bail!("{}: data row {} has no key", file, i + 1),
        };
        let mut values: Vec<Box<str>> = words.collect();
        if values.len() > columns.len() {
            return Err(PipelineError::DimensionMismatch {
                what: format!("{}: row {}", file, key).into(),
                expected: format!("at most {} values", columns.len()).into(),
                found: format!("{} values", values.len()).into(),
            }
            .into());
        }
        values.resize(columns.len(), "".into());
        rows.push((key, values));
    }

    info!(
        "read {} annotation rows with columns [{}] from {}",
        rows.len(),
        columns.join(", "),
        file
    );

    Ok(AnnotationTable {
        key_column,
        columns,
        rows,
    })
}
