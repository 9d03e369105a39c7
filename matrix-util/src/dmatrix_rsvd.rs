use crate::traits::SampleOps;
use log::debug;
use nalgebra::{DMatrix, DVector};

type Mat = DMatrix<f32>;
type Vec = DVector<f32>;

pub trait RSVD {
    /// Randomized SVD with an explicit seed for the random test matrix
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, Vec, Mat)>;
}

impl RSVD for Mat {
    fn rsvd(&self, rank: usize, seed: u64) -> anyhow::Result<(Mat, Vec, Mat)> {
        let default_iter = 5;
        let mut rsvd = RandomizedSVD::new(rank, default_iter, seed);
        rsvd.compute(self)?;
        Ok((
            rsvd.matrix_u().clone(),
            rsvd.singular_values().clone(),
            rsvd.matrix_v().clone(),
        ))
    }
}

/// Randomized SVD
///
/// Implement Alg 4.4 of Halko et al. (2009) with QR
/// re-orthonormalization between power iterations. The Gaussian test
/// matrix is drawn from `seed`, so identical inputs give identical
/// factors.
///
pub struct RandomizedSVD {
    max_rank: usize,
    iter: usize,
    seed: u64,
    u_vectors: Mat,
    singular_values: Vec,
    v_vectors: Mat,
}

impl RandomizedSVD {
    pub fn new(max_rank: usize, iter: usize, seed: u64) -> Self {
        Self {
            max_rank,
            iter,
            seed,
            u_vectors: Mat::zeros(0, 0),
            singular_values: Vec::zeros(0),
            v_vectors: Mat::zeros(0, 0),
        }
    }

    pub fn matrix_u(&self) -> &Mat {
        &self.u_vectors
    }

    pub fn matrix_v(&self) -> &Mat {
        &self.v_vectors
    }

    pub fn singular_values(&self) -> &Vec {
        &self.singular_values
    }

    pub fn compute(&mut self, xx: &Mat) -> anyhow::Result<()> {
        let nr = xx.nrows();
        let nc = xx.ncols();

        let mut rank = nr.min(nc);
        let mut oversample = 0;

        if self.max_rank > 0 && rank > self.max_rank {
            rank = self.max_rank;
            oversample = 5.min(nr.min(nc) - rank);
        }

        if rank == 0 {
            anyhow::bail!("randomized SVD on an empty [{} x {}] matrix", nr, nc);
        }

        let qq = self.rand_subspace_iteration(xx, rank + oversample);

        let bb = qq.transpose() * xx;

        debug!("Final svd on [{} x {}]", bb.nrows(), bb.ncols());

        let svd = bb.svd(true, true);

        if let (Some(svd_u), Some(svd_vt)) = (svd.u, svd.v_t) {
            let rank = rank.min(svd.singular_values.len());
            self.u_vectors = &qq * svd_u.columns(0, rank);
            self.v_vectors = svd_vt.transpose().columns(0, rank).into_owned();
            self.singular_values = svd.singular_values.rows(0, rank).into_owned();
        } else {
            anyhow::bail!("SVD failed");
        }

        Ok(())
    }

    // Find an orthonormal matrix qq whose range approximates the range of xx
    fn rand_subspace_iteration(&self, xx: &Mat, rank_and_oversample: usize) -> Mat {
        let nc = xx.ncols();

        let omega = Mat::rnorm_seeded(nc, rank_and_oversample, self.seed);
        let mut qq = (xx * omega).qr().q();

        for i in 0..self.iter {
            let zz = (xx.transpose() * &qq).qr().q();
            qq = (xx * zz).qr().q();
            debug!("power iteration {:>5}: Q [{} x {}]", i + 1, qq.nrows(), qq.ncols());
        }

        qq
    }
}
