//! diskport importer library
//!
//! Pulls a virtual-disk image from an endpoint into a destination volume,
//! peeling compression and archive layers on the fly and converting disk
//! containers to raw.
//!
//! ## Pipeline
//!
//! ```text
//! Endpoint ──► Resolver ──► DataStream (sniff / decode / replay links) ──► Copier ──► dest
//!                                      │                                    │
//!                                      └────────────── Closer ◄─────────────┘
//! ```
//!
//! ## Modules
//!
//! - `endpoint`: endpoint parsing and credentials
//! - `resolver`: opens file, HTTP(S) and object-store sources
//! - `chain`: the decode chain built over a source
//! - `copier`: direct, convert and streaming-convert paths
//! - `converter`: the conversion trait, `qemu-img` and a scripted double
//! - `closer`: idempotent teardown
//! - `clone`: the socket-based volume clone pair

pub mod chain;
pub mod clone;
pub mod closer;
pub mod config;
pub mod converter;
pub mod copier;
pub mod endpoint;
pub mod error;
pub mod importer;
pub mod logging;
pub mod replay;
pub mod resolver;
pub mod s3;
pub mod tar_entry;

pub use chain::{Closable, DataStream, LinkKind};
pub use config::{ImporterConfig, ImporterSettings};
pub use converter::{ConverterError, ImageConverter, QemuImg, ScriptedConverter};
pub use copier::{CopyMode, CopyOutcome};
pub use endpoint::{Credentials, Endpoint, Scheme};
pub use error::ImportError;
pub use importer::{ImportReport, Importer};
