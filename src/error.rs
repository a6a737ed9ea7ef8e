use crate::region::RegionId;

/// Fatal-class errors. `init` and `define_region` are the only two
/// callbacks that produce one; everything else degrades into "keep
/// recording" instead of returning an error.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("region {0} was defined twice")]
    DuplicateRegion(RegionId),
}
