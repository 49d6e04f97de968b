//! # Disklabel Labels
//!
//! Partition table drivers and the context that drives them.
//!
//! Supported formats:
//! - **DOS**: Master Boot Record with extended/logical partitions
//! - **GPT**: GUID Partition Table with protective MBR and backup header
//! - **BSD**: BSD disklabel, on a whole disk or inside a DOS partition
//! - **SGI**: IRIX volume header
//! - **SUN**: Sun VTOC label
//!
//! A [`Context`] owns one device, probes it for a label and routes every
//! operation to the active driver. Anything a driver needs from a user goes
//! through the dialog handler registered on the context. A [`Script`]
//! describes a whole table as text and can be applied to a context.
//!
//! ## Example
//!
//! ```rust
//! use disklabel_core::{DefaultAnswers, Partition};
//! use disklabel_labels::{Context, LabelKind};
//! use std::io::Cursor;
//!
//! let mut cxt = Context::new();
//! cxt.set_ask_handler(DefaultAnswers);
//! let image = Cursor::new(vec![0u8; 8 * 1024 * 1024]);
//! cxt.assign_device_handle(Box::new(image), "disk.img", false).unwrap();
//! cxt.create_disklabel(Some("gpt")).unwrap();
//!
//! let mut pa = Partition::new();
//! pa.start_follow_default(true);
//! pa.partno_follow_default(true);
//! pa.set_size(4096);
//! cxt.add_partition(Some(&pa)).unwrap();
//!
//! assert!(cxt.is_label(LabelKind::Gpt));
//! assert_eq!(cxt.get_partition(0).unwrap().start, Some(2048));
//! ```

pub mod bsd;
pub mod context;
pub mod dos;
pub mod gpt;
pub mod label;
mod planner;
pub mod script;
pub mod sgi;
pub mod sun;

pub use bsd::BsdLabel;
pub use context::{Context, ContextConfig, ContextState, Disk};
pub use dos::DosLabel;
pub use gpt::GptLabel;
pub use label::{Label, LabelKind, LabelOps, LabelState};
pub use script::Script;
pub use sgi::SgiLabel;
pub use sun::SunLabel;
