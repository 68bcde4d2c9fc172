use std::io::{Error, ErrorKind};

use rayon::ThreadPoolBuildError;

pub struct PoolBuildError(pub ThreadPoolBuildError);

impl From<PoolBuildError> for Error {
    fn from(err: PoolBuildError) -> Self {
        Error::new(ErrorKind::Other, err.0.to_string())
    }
}
