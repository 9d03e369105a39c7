use crate::centile::CentileArgs;
use crate::cluster::ClusterArgs;
use crate::feature_selection::FeatureSelectionArgs;
use crate::integrate::IntegrationArgs;
use crate::metadata::MetadataArgs;
use crate::normalize::NormalizeArgs;
use crate::pca::PcaArgs;
use crate::projection::ProjectionArgs;
use crate::qc::QcThresholds;

use matrix_util::common_io::{mkdir, open_buf_reader, open_buf_writer};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// Every knob of a pipeline run. Missing fields in a JSON file take
/// their default values.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub metadata: MetadataArgs,
    pub qc: QcThresholds,
    pub normalize: NormalizeArgs,
    pub features: FeatureSelectionArgs,
    pub pca: PcaArgs,
    pub integration: IntegrationArgs,
    pub cluster: ClusterArgs,
    pub projection: ProjectionArgs,
    pub centile: CentileArgs,
}

impl PipelineConfig {
    pub fn from_json_file(file: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(file)?;
        serde_json::from_reader(reader)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", file, e))
    }

    pub fn to_json_file(&self, file: &str) -> anyhow::Result<()> {
        mkdir(file)?;
        let mut writer = open_buf_writer(file)?;
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DEFAULT_SEED;
    use crate::pca::{PcaSolver, DEFAULT_MAX_EXACT_DIM};
    use matrix_util::common_io::create_temp_dir_file;

    #[test]
    fn test_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.qc.min_features, 500);
        assert_eq!(cfg.qc.max_percent_mito, 15.0);
        assert_eq!(cfg.qc.max_total_count, 100_000.0);
        assert_eq!(cfg.normalize.scale_factor, 10_000.0);
        assert_eq!(cfg.features.n_features, 5000);
        assert_eq!(cfg.cluster.n_dims, 15);
        assert_eq!(cfg.cluster.resolution, 0.5);
        assert_eq!(cfg.integration.min_cca_rank, 2);
        assert_eq!(cfg.centile.threshold, 95);
        assert_eq!(
            cfg.pca.solver,
            PcaSolver::Auto {
                max_exact_dim: DEFAULT_MAX_EXACT_DIM,
                seed: DEFAULT_SEED
            }
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() -> anyhow::Result<()> {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{ "cluster": { "resolution": 1.2, "seed": 7 } }"#)?;
        assert_eq!(cfg.cluster.resolution, 1.2);
        assert_eq!(cfg.cluster.seed, 7);
        assert_eq!(cfg.cluster.knn, 20);
        assert_eq!(cfg.qc, QcThresholds::default());
        Ok(())
    }

    #[test]
    fn test_file_round_trip() -> anyhow::Result<()> {
        let file = create_temp_dir_file(".json")?;
        let file = file.to_str().unwrap();

        let mut cfg = PipelineConfig::default();
        cfg.integration.tolerate_partial = true;
        cfg.centile.genes = vec!["CD3E".into(), "MS4A1".into()];
        cfg.to_json_file(file)?;

        let back = PipelineConfig::from_json_file(file)?;
        assert_eq!(cfg, back);
        Ok(())
    }
}
