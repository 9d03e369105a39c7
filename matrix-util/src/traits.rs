/// Normalize, centre or scale columns
pub trait MatOps {
    type Mat;
    type Scalar;

    fn normalize_columns_inplace(&mut self);
    fn normalize_columns(&self) -> Self::Mat;
    fn scale_columns_inplace(&mut self);
    fn scale_columns(&self) -> Self::Mat;
    fn centre_columns_inplace(&mut self);
    fn centre_columns(&self) -> Self::Mat;
}

/// Normalize rows to unit Euclidean length
pub trait RowOps {
    type Mat;

    fn normalize_rows_inplace(&mut self);
}

/// Summaries kept by running statistics containers
pub trait RunningStatOps<T> {
    type Output;

    fn clear(&mut self);
    fn count_positives(&self) -> Self::Output;
    fn sum(&self) -> Self::Output;
    fn mean(&self) -> Self::Output;
    fn variance(&self) -> Self::Output;
    fn std(&self) -> Self::Output;
}

/// Operations to sample random matrices with an explicit seed so
/// that downstream numerical routines stay reproducible
pub trait SampleOps {
    type Mat;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm_seeded(dd: usize, nn: usize, seed: u64) -> Self::Mat;
}
