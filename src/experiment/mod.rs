//! Raster scan sequencing.

pub mod dataset;
pub mod scanner;
pub mod traversal;

pub use dataset::{SampleColumn, SampleTable};
pub use scanner::{AbortHandle, ScanOrchestrator, ScanPhase, ScanProgress};
pub use traversal::{Boustrophedon, GridPoint};
