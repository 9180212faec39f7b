//! LINDI: a cloud friendly container for hierarchical scientific datasets.
//!
//! General design:
//! - The unit of truth is the *reference file system*: a JSON document
//!   mapping Zarr v2 store keys to inline bytes or `(url, offset, size)`
//!   references. It lives in the [`format`] module.
//! - [`store::ReferenceStore`] presents that document as a Zarr key/value
//!   store. Reads dispatch to inline data, byte ranges inside the enclosing
//!   container, or remote range requests through the [`fetch`] resolver,
//!   memoized on disk by the [`cache`].
//! - [`tar::LindiTarFile`] is the random access container: a tar archive
//!   with a self-describing index that opens in two range requests and can
//!   grow designated members in place.
//! - [`hdf5::translate_hdf5`] walks an HDF5 tree (through the external
//!   [`hdf5::Hdf5Reader`] collaborator) and emits a reference file system
//!   keyed by the original file's chunk byte ranges.
//! - Writes collect in a [`staging::StagingArea`] until finalization folds
//!   them into a container.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod file;
pub mod format;
pub mod hdf5;
pub mod staging;
pub mod store;
#[cfg(test)]
pub mod strategies;
pub mod tar;

pub use config::{CacheSettings, LindiConfig, RetriesSettings};
pub use file::{Format, OpenMode, open_lindi, open_lindi_opts, write_lindi};
pub use format::rfs::{ExternalRef, RefValue, ReferenceFileSystem};
pub use hdf5::{Hdf5Reader, translate_hdf5};
pub use store::ReferenceStore;
pub use tar::LindiTarFile;

mod private {
    /// Seals traits user code must not implement, so they can grow methods
    /// without breaking downstream crates.
    pub trait Sealed {}
}
