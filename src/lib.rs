pub mod error;
pub mod dtype;
pub mod codec;
pub mod region;
pub mod plan;
pub mod loopback;
pub mod downsample;
pub mod block;
pub mod source;
pub mod writer;
pub mod progress;
pub mod memory;
pub mod export;

pub use error::{ErrorKind, ExportError, Result};
pub use dtype::{DataType, Pixel};
pub use codec::{Compression, get_codec};
pub use plan::{LevelPlan, PlannerConfig, PyramidLevel, propose_mipmaps};
pub use downsample::DownsamplingMethod;
pub use source::{InMemoryImage, SourceImage, VirtualImage, VoxelSize};
pub use writer::{directory_storage, DatasetWriter, Layout, N5Writer, OmeZarrWriter, Storage};
pub use export::{ExportJob, ExportOptions, ExportSummary, export_pyramid, export_to_directory};
