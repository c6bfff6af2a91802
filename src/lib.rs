//! tubstore - append-only, crash-safe telemetry datastore
//!
//! A datastore ("tub") records one JSON object per control-loop tick into a
//! directory of bounded segment files, indexed by a five-line
//! `manifest.json`. Records can be soft-deleted and restored, iterated in
//! write order, and read back by their logical index.
//!
//! ```no_run
//! use serde_json::json;
//! use tubstore::{Datastore, DatastoreOptions};
//!
//! # fn main() -> tubstore::Result<()> {
//! let options = DatastoreOptions::default()
//!     .with_schema(["user/angle", "user/throttle"], ["float", "float"]);
//! let mut tub = Datastore::open("data/tub_1", options)?;
//! tub.write_record(&json!({"user/angle": 0.1, "user/throttle": 0.3}))?;
//! tub.delete_records(0_u64)?;
//! for record in tub.iter() {
//!     println!("{:?}", record?);
//! }
//! tub.close();
//! # Ok(())
//! # }
//! ```
//!
//! The crate also builds the `tub` inspection binary; [`cli`], [`config`]
//! and [`error_hints`] exist for it.

#![deny(unsafe_code)]
#![cfg_attr(
    test,
    allow(
        clippy::uninlined_format_args,
        clippy::missing_const_for_fn,
        clippy::cast_possible_truncation
    )
)]
#![allow(
    clippy::must_use_candidate,
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss
)]

pub mod cli;
pub mod config;
pub mod datastore;
pub mod error;
pub mod error_hints;
pub mod iter;
pub mod line_file;
pub mod manifest;
pub mod record;
pub mod segment;
pub mod session;

pub use datastore::{Datastore, DatastoreOptions, IndexSet};
pub use error::{Error, Result};
pub use iter::{DatastoreIterator, IterState};
pub use line_file::ReadStrategy;
pub use record::Record;
pub use session::{SessionHistory, SessionId};
