use crate::common::*;

use fnv::FnvHashMap as HashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

const IDENTIFIER_PATTERN: &str = r"^(?P<donor>[^.]+)\.(?P<barcode>[ACGT]+)\.(?P<rep>[0-9])$";

/// What to do when the annotation table repeats a key
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DuplicateKeyPolicy {
    Reject,
    #[default]
    FirstMatch,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MetadataArgs {
    pub duplicate_keys: DuplicateKeyPolicy,
    /// characters treated as equivalent to `.` when matching
    /// annotation keys against cell identifiers
    pub separators: Vec<char>,
}

impl Default for MetadataArgs {
    fn default() -> Self {
        MetadataArgs {
            duplicate_keys: DuplicateKeyPolicy::default(),
            separators: vec!['-', '_'],
        }
    }
}

/// External per-cell annotation: a key column plus named value columns
#[derive(Clone, Debug, PartialEq, Default)]
pub struct AnnotationTable {
    pub key_column: Box<str>,
    pub columns: Vec<Box<str>>,
    pub rows: Vec<(Box<str>, Vec<Box<str>>)>,
}

/// One record per cell
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CellMeta {
    pub cell: Box<str>,
    pub donor: Box<str>,
    pub barcode: Box<str>,
    pub replicate: Box<str>,
    pub replicate_name: Box<str>,
    /// parallel to `CellMetadata::annotation_columns`; empty when the
    /// cell had no annotation row
    pub annotations: Vec<Box<str>>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct CellMetadata {
    pub annotation_columns: Vec<Box<str>>,
    pub records: Vec<CellMeta>,
}

impl CellMetadata {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cells(&self) -> Vec<Box<str>> {
        self.records.iter().map(|r| r.cell.clone()).collect()
    }

    pub fn donors(&self) -> Vec<Box<str>> {
        self.records.iter().map(|r| r.donor.clone()).collect()
    }

    /// Values of a named column: one of the built-in fields (`donor`,
    /// `barcode`, `replicate`, `replicate_name`) or an annotation column
    pub fn column(&self, name: &str) -> Option<Vec<Box<str>>> {
        let recs = self.records.iter();
        let values: Vec<Box<str>> = match name {
            "cell" => recs.map(|r| r.cell.clone()).collect(),
            "donor" => recs.map(|r| r.donor.clone()).collect(),
            "barcode" => recs.map(|r| r.barcode.clone()).collect(),
            "replicate" => recs.map(|r| r.replicate.clone()).collect(),
            "replicate_name" => recs.map(|r| r.replicate_name.clone()).collect(),
            _ => {
                let k = self.annotation_columns.iter().position(|c| c.as_ref() == name)?;
                recs.map(|r| r.annotations[k].clone()).collect()
            }
        };
        Some(values)
    }

    /// Keep the listed records, in the given order
    pub fn subset(&self, positions: &[usize]) -> anyhow::Result<Self> {
        let records = positions
            .iter()
            .map(|&i| {
                self.records
                    .get(i)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("metadata row {} out of range", i))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(CellMetadata {
            annotation_columns: self.annotation_columns.clone(),
            records,
        })
    }
}

/// Split `<donor>.<barcode>.<replicate>` into its three fields
pub struct IdentifierParser {
    re: Regex,
}

impl IdentifierParser {
    pub fn new() -> anyhow::Result<Self> {
        Ok(IdentifierParser {
            re: Regex::new(IDENTIFIER_PATTERN)?,
        })
    }

    pub fn parse(&self, identifier: &str, position: usize) -> anyhow::Result<(Box<str>, Box<str>, Box<str>)> {
        let caps = self
            .re
            .captures(identifier)
            .ok_or_else(|| PipelineError::MalformedIdentifier {
                identifier: identifier.into(),
                position,
            })?;
        Ok((
            Box::from(&caps["donor"]),
            Box::from(&caps["barcode"]),
            Box::from(&caps["rep"]),
        ))
    }
}

/// Map every separator character to `.`
pub fn normalize_key(key: &str, separators: &[char]) -> Box<str> {
    key.chars()
        .map(|c| if separators.contains(&c) { '.' } else { c })
        .collect::<String>()
        .into_boxed_str()
}

/// Index the annotation rows by normalized key according to the
/// duplicate policy
fn index_annotation<'a>(
    table: &'a AnnotationTable,
    args: &MetadataArgs,
) -> anyhow::Result<HashMap<Box<str>, &'a [Box<str>]>> {
    let mut index: HashMap<Box<str>, &'a [Box<str>]> = HashMap::default();
    let mut dup_count: HashMap<Box<str>, usize> = HashMap::default();

    for (key, values) in table.rows.iter() {
        if values.len() != table.columns.len() {
            return Err(PipelineError::DimensionMismatch {
                what: format!("annotation row `{}`", key).into(),
                expected: format!("{} values", table.columns.len()).into(),
                found: format!("{} values", values.len()).into(),
            }
            .into());
        }
        let nkey = normalize_key(key, &args.separators);
        if index.contains_key(&nkey) {
            *dup_count.entry(nkey).or_insert(1) += 1;
        } else {
            index.insert(nkey, values.as_slice());
        }
    }

    if !dup_count.is_empty() {
        let mut dups: Vec<(Box<str>, usize)> = dup_count.into_iter().collect();
        dups.sort();
        match args.duplicate_keys {
            DuplicateKeyPolicy::Reject => {
                let (key, count) = dups.swap_remove(0);
                return Err(PipelineError::DuplicateAnnotationKey { key, count }.into());
            }
            DuplicateKeyPolicy::FirstMatch => {
                let shadowed: usize = dups.iter().map(|(_, n)| n - 1).sum();
                warn!(
                    "{} annotation keys are duplicated; keeping the first row, {} rows shadowed",
                    dups.len(),
                    shadowed
                );
            }
        }
    }

    Ok(index)
}

/// Derive one metadata record per cell identifier and left-join the
/// external annotation table.
///
/// * `identifiers` - raw cell identifiers in matrix column order
/// * `annotation` - optional table keyed by a compatible identifier
/// * `args` - duplicate-key policy and separator normalization
pub fn build_metadata(
    identifiers: &[Box<str>],
    annotation: Option<&AnnotationTable>,
    args: &MetadataArgs,
) -> anyhow::Result<CellMetadata> {
    let parser = IdentifierParser::new()?;

    let empty = AnnotationTable::default();
    let table = annotation.unwrap_or(&empty);
    let index = index_annotation(table, args)?;
    let n_cols = table.columns.len();

    let mut n_matched = 0;
    let mut records = Vec::with_capacity(identifiers.len());

    for (position, id) in identifiers.iter().enumerate() {
        let (donor, barcode, replicate) = parser.parse(id, position)?;
        let replicate_name: Box<str> = format!("{}_{}", donor, replicate).into();

        let annotations = match index.get(&normalize_key(id, &args.separators)) {
            Some(values) => {
                n_matched += 1;
                values.to_vec()
            }
            None => vec![Box::<str>::from(""); n_cols],
        };

        records.push(CellMeta {
            cell: id.clone(),
            donor,
            barcode,
            replicate,
            replicate_name,
            annotations,
        });
    }

    if annotation.is_some() {
        info!(
            "annotation: {} cells matched, {} unmatched",
            n_matched,
            identifiers.len() - n_matched
        );
    }
    info!("built metadata for {} cells", records.len());

    Ok(CellMetadata {
        annotation_columns: table.columns.clone(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(xs: &[&str]) -> Vec<Box<str>> {
        xs.iter().map(|&x| x.into()).collect()
    }

    fn table(rows: &[(&str, &str)]) -> AnnotationTable {
        AnnotationTable {
            key_column: "cell".into(),
            columns: vec!["celltype".into()],
            rows: rows
                .iter()
                .map(|&(k, v)| (k.into(), vec![v.into()]))
                .collect(),
        }
    }

    #[test]
    fn test_parse_identifiers() -> anyhow::Result<()> {
        let meta = build_metadata(
            &ids(&["D1.ACGT.1", "donor-2.TTGA.3"]),
            None,
            &MetadataArgs::default(),
        )?;
        assert_eq!(meta.len(), 2);
        assert_eq!(meta.records[0].donor.as_ref(), "D1");
        assert_eq!(meta.records[0].barcode.as_ref(), "ACGT");
        assert_eq!(meta.records[1].replicate_name.as_ref(), "donor-2_3");
        assert!(meta.annotation_columns.is_empty());
        Ok(())
    }

    #[test]
    fn test_malformed_identifier() {
        for bad in ["D1.ACGN.1", "D1.ACGT.12", "D1_ACGT_1", "D1.ACGT"] {
            let err = build_metadata(&ids(&["D1.ACGT.1", bad]), None, &MetadataArgs::default())
                .err()
                .expect("should fail");
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::MalformedIdentifier { position: 1, .. })
            ));
        }
    }

    #[test]
    fn test_left_join_with_normalized_keys() -> anyhow::Result<()> {
        let ann = table(&[("D1_ACGT_1", "T"), ("D9-AAAA-1", "B")]);
        let meta = build_metadata(
            &ids(&["D1.ACGT.1", "D1.CCCC.1"]),
            Some(&ann),
            &MetadataArgs::default(),
        )?;
        assert_eq!(meta.records[0].annotations[0].as_ref(), "T");
        assert_eq!(meta.records[1].annotations[0].as_ref(), "");
        assert_eq!(meta.column("celltype").map(|c| c.len()), Some(2));
        assert_eq!(meta.column("donor").unwrap()[1].as_ref(), "D1");
        assert!(meta.column("missing").is_none());
        Ok(())
    }

    #[test]
    fn test_duplicate_key_policy() -> anyhow::Result<()> {
        let ann = table(&[("D1.ACGT.1", "first"), ("D1_ACGT_1", "second")]);
        let cells = ids(&["D1.ACGT.1"]);

        let meta = build_metadata(&cells, Some(&ann), &MetadataArgs::default())?;
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.records[0].annotations[0].as_ref(), "first");

        let reject = MetadataArgs {
            duplicate_keys: DuplicateKeyPolicy::Reject,
            ..Default::default()
        };
        let err = build_metadata(&cells, Some(&ann), &reject).err().expect("should fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DuplicateAnnotationKey { count: 2, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_subset_keeps_order() -> anyhow::Result<()> {
        let meta = build_metadata(
            &ids(&["A.AC.1", "B.GT.2", "C.TT.3"]),
            None,
            &MetadataArgs::default(),
        )?;
        let sub = meta.subset(&[2, 0])?;
        assert_eq!(sub.donors(), ids(&["C", "A"]));
        assert!(meta.subset(&[3]).is_err());
        Ok(())
    }
}
