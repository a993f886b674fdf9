use smallvec::SmallVec;

pub mod codec;
pub mod config;
pub mod container;
mod error;
pub mod expr;
pub mod iter;
pub mod linalg;
pub mod shape;
mod util;

/// Maximum rank of an array. A fixed cap keeps coordinate vectors inline
/// and is enough for the engine's cases.
pub const DIMENSION_MAX: usize = 8;

pub type CoordVec<T> = SmallVec<[T; DIMENSION_MAX]>;
pub type GridCoord = CoordVec<u64>;
/// Signed coordinates as used by slice bounds, where negative values wrap.
pub type SliceCoord = CoordVec<i64>;

pub use config::{CodecId, Config, Context, EvalStrategy, Filter};
pub use container::{ArrayView, Container, Element, NdRead};
pub use error::{Error, Result};
pub use expr::Expression;
pub use shape::{DType, DtShape};

pub trait Ndim {
    fn ndim(&self) -> usize;

    fn same_ndim<T: Ndim>(&self, other: &T) -> Result<usize> {
        let n = self.ndim();
        if n == other.ndim() {
            Ok(n)
        } else {
            Err(Error::invalid_argument("inconsistent dimensionalities"))
        }
    }
}

