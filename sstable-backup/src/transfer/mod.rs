//! Moving manifest entries between the node and remote storage.

pub mod download;
pub mod progress;
pub mod tracker;
pub mod upload;

pub use download::{Download, DownloadTracker};
pub use progress::SessionProgress;
pub use tracker::{Session, Tracker, Transfer, Unit, UnitState, DEFAULT_POLL_INTERVAL};
pub use upload::{Upload, UploadTracker};
