//! Volume-to-volume clone over a local socket.
//!
//! The source worker streams its image as a single-entry tar archive into a
//! Unix socket; the target worker accepts exactly one connection, unwraps
//! that archive and writes the entry out byte for byte.

use std::fs::{self, File};
use std::io;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::ImportError;
use crate::importer::{ImportReport, Importer};

/// Name of the single entry in the clone archive.
pub const CLONE_ENTRY_NAME: &str = "disk.img";

const SOCKET_NAME: &str = "clone.sock";

/// Where the pair of clone workers meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRendezvous {
    socket_dir: PathBuf,
    id: String,
}

impl CloneRendezvous {
    /// `id` becomes a path component, so it must be a plain name.
    pub fn new(socket_dir: impl Into<PathBuf>, id: impl Into<String>) -> Result<Self, ImportError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains('/')
            && !id.contains('\0');
        if !valid {
            return Err(ImportError::InvalidEndpoint {
                endpoint: id,
                reason: "clone id must be a single path component".to_string(),
            });
        }
        Ok(Self {
            socket_dir: socket_dir.into(),
            id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.id).join(SOCKET_NAME)
    }
}

/// Clone worker settings.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    pub socket_dir: PathBuf,
    /// Image inside the mounted volume.
    pub image_path: PathBuf,
    /// How long the source waits for the target's socket.
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp/clone/socket"),
            image_path: PathBuf::from("/tmp/clone/image/disk.img"),
            connect_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_millis(500),
        }
    }
}

/// Stream the source image to the target. Returns the payload bytes sent.
pub fn send_source(rendezvous: &CloneRendezvous, config: &CloneConfig) -> Result<u64, ImportError> {
    let image = File::open(&config.image_path)
        .map_err(|e| ImportError::io(format!("opening {}", config.image_path.display()), e))?;
    let size = image
        .metadata()
        .map_err(|e| ImportError::io(format!("inspecting {}", config.image_path.display()), e))?
        .len();

    let socket = connect_with_retry(&rendezvous.socket_path(), config)?;
    info!(id = rendezvous.id(), bytes = size, "Streaming image to clone target");

    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);

    let mut builder = tar::Builder::new(socket);
    builder
        .append_data(&mut header, CLONE_ENTRY_NAME, image)
        .map_err(|e| ImportError::io("sending clone archive", e))?;
    let socket = builder
        .into_inner()
        .map_err(|e| ImportError::io("finishing clone archive", e))?;

    match socket.shutdown(Shutdown::Write) {
        Err(e) if e.kind() != io::ErrorKind::NotConnected => {
            return Err(ImportError::io("closing clone socket", e));
        }
        _ => {}
    }
    info!(id = rendezvous.id(), bytes = size, "Clone source finished");
    Ok(size)
}

fn connect_with_retry(path: &Path, config: &CloneConfig) -> Result<UnixStream, ImportError> {
    let deadline = Instant::now() + config.connect_timeout;
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(ImportError::unreachable(path.display().to_string(), e));
            }
            Err(e) => {
                debug!(socket = %path.display(), error = %e, "Clone target not ready, retrying");
                thread::sleep(config.retry_interval);
            }
        }
    }
}

/// Removes the socket file however the target exits.
struct SocketFile(PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => debug!(socket = %self.0.display(), "Removed clone socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.0.display(), error = %e, "Failed to remove clone socket"),
        }
    }
}

/// Accept one clone connection and copy the image it carries into `dest`.
///
/// The source already holds the target's final image, so only the archive
/// wrapping is removed. Content that looks compressed or archived is kept as is.
pub fn receive_target(
    rendezvous: &CloneRendezvous,
    importer: &Importer,
    dest: &Path,
) -> Result<ImportReport, ImportError> {
    let path = rendezvous.socket_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| ImportError::io(format!("creating {}", dir.display()), e))?;
    }
    // A leftover socket from an earlier attempt would make bind fail
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(ImportError::io(format!("removing stale {}", path.display()), e));
        }
    }

    let listener = UnixListener::bind(&path)
        .map_err(|e| ImportError::io(format!("binding {}", path.display()), e))?;
    let _socket_file = SocketFile(path.clone());
    info!(id = rendezvous.id(), socket = %path.display(), "Waiting for clone source");

    let (stream, _) = listener
        .accept()
        .map_err(|e| ImportError::io("accepting clone connection", e))?;
    drop(listener);
    debug!(id = rendezvous.id(), "Clone source connected");

    let endpoint = Endpoint::from_file_path(&path)?;
    importer.import_archive(endpoint, Box::new(stream), dest)
}
