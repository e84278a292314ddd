//! Teardown of an import attempt's resources.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::chain::{ChainLink, LinkKind};

/// Owns every chain link and scratch file of one import attempt.
///
/// [`Closer::close`] closes links in construction order, then removes any
/// scratch files still registered. It keeps going past failures and
/// reports the first one; later failures are logged, not returned.
#[derive(Default)]
pub struct Closer {
    links: Vec<ChainLink>,
    scratch: Vec<PathBuf>,
    closed: bool,
}

impl Closer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_link(&mut self, link: ChainLink) {
        self.links.push(link);
    }

    /// Kinds of the links constructed so far, in order.
    pub fn link_kinds(&self) -> Vec<LinkKind> {
        self.links.iter().map(|link| link.kind()).collect()
    }

    /// Register a file to delete at teardown unless released first.
    pub fn track_scratch(&mut self, path: PathBuf) {
        self.scratch.push(path);
    }

    /// Stop tracking a scratch file that was committed or already removed.
    pub fn release_scratch(&mut self, path: &Path) {
        self.scratch.retain(|p| p != path);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close everything. Calling this again is a no-op that returns `Ok`.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for (index, link) in self.links.iter().enumerate() {
            if let Err(e) = link.close() {
                warn!(link = index, kind = %link.kind(), error = %e, "Failed to close chain link");
                first_error.get_or_insert(e);
            }
        }

        for path in self.scratch.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(links = self.links.len(), "Import chain closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
