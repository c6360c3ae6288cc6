//! Product metadata input/output

pub mod annotation;
pub mod manifest;
pub mod safe;

pub use annotation::{TiePointGrid, TiePointGridReader};
pub use manifest::{ManifestInfo, ManifestReader};
pub use safe::SafeProduct;
