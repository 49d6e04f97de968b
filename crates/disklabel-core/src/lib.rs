//! # Disklabel Core
//!
//! Format independent building blocks for reading and editing partition
//! tables:
//! - **Geometry/alignment**: device topology and partition boundary rules
//! - **Partitions and tables**: the label independent partition model
//! - **Partition types**: catalogs and type lookup
//! - **Dialog**: requests a label driver sends to whatever front end is in use
//! - **Fields**: column descriptions for listings
//!
//! The label drivers themselves live in `disklabel-labels`.
//!
//! ## Example
//!
//! ```rust
//! use disklabel_core::{AlignDirection, Topology};
//!
//! let topo = Topology::for_image(512 * 1024 * 1024, 512);
//! assert_eq!(topo.align_lba(3000, AlignDirection::Up), 4096);
//! ```

pub mod alignment;
pub mod ask;
pub mod device;
pub mod error;
pub mod field;
pub mod geometry;
pub mod limits;
pub mod partition;
pub mod parttype;
pub mod size;
pub mod table;
pub mod traits;

// Re-export commonly used items
pub use alignment::AlignDirection;
pub use ask::{do_ask, Ask, AskHandler, AskKind, DefaultAnswers, MenuAsk, MenuItem, NumberAsk, StringAsk, YesNoAsk};
pub use error::{Error, Result};
pub use field::{Field, FieldFormat, FieldId};
pub use geometry::{Geometry, Topology, UserProperties};
pub use partition::{cmp_partno, cmp_start, partname, Partition};
pub use parttype::{PartType, PartTypeDef};
pub use size::{parse_size, size_to_human_string};
pub use table::{free_runs, Direction, Table, TableIter};
pub use traits::{DeviceIo, ReadSeek, ReadWriteSeek};
