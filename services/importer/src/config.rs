//! Importer configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use url::Url;

use crate::endpoint::Credentials;

/// Default object-store base URL.
pub const DEFAULT_S3_ENDPOINT: &str = "https://s3.amazonaws.com";

/// Default destination inside the worker's volume mount.
pub const DEFAULT_DEST: &str = "/data/disk.img";

/// Tunables of the import pipeline.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Decode stages allowed before the payload is rejected.
    pub max_nesting_depth: usize,
    /// Buffer size of the direct copy.
    pub copy_buffer_size: usize,
    /// Scratch directory for the convert path. Defaults to the destination's directory.
    pub scratch_dir: Option<PathBuf>,
    /// Base URL `s3://bucket/key` endpoints resolve against.
    pub s3_endpoint: Url,
    pub connect_timeout: Duration,
    /// Whole-request timeout. Unbounded by default since images can be large.
    pub request_timeout: Option<Duration>,
    /// Transcode disk-container payloads to the target format.
    pub convert: bool,
    /// Let the converter pull plain network qcow2 sources itself.
    pub streaming_convert: bool,
    pub target_format: String,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 4,
            copy_buffer_size: 1024 * 1024, // 1 MiB
            scratch_dir: None,
            s3_endpoint: default_s3_endpoint(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
            convert: true,
            streaming_convert: true,
            target_format: "raw".to_string(),
        }
    }
}

fn default_s3_endpoint() -> Url {
    match Url::parse(DEFAULT_S3_ENDPOINT) {
        Ok(url) => url,
        Err(_) => unreachable!("default object-store endpoint is a valid URL"),
    }
}

/// Worker settings as injected by the orchestration layer.
#[derive(Clone, Args)]
pub struct ImporterSettings {
    /// Source endpoint (file://, http://, https:// or s3://).
    #[arg(long, env = "IMPORTER_ENDPOINT")]
    pub endpoint: String,

    /// Access key for the endpoint.
    #[arg(long, env = "IMPORTER_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Secret key for the endpoint.
    #[arg(long, env = "IMPORTER_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Destination image path or block device.
    #[arg(long, env = "IMPORTER_DEST", default_value = DEFAULT_DEST)]
    pub dest: PathBuf,

    /// Log verbosity (0 = warn, 1 = info, 2 = debug, 3 = trace).
    #[arg(short, long, env = "IMPORTER_VERBOSITY", default_value_t = 1)]
    pub verbosity: u8,

    /// Path of the qemu-img binary.
    #[arg(long, env = "IMPORTER_QEMU_IMG", default_value = "qemu-img")]
    pub qemu_img: PathBuf,

    /// Override the maximum number of nested decode stages.
    #[arg(long, env = "IMPORTER_NESTING_DEPTH")]
    pub max_nesting_depth: Option<usize>,

    /// Object-store base URL for s3:// endpoints.
    #[arg(long, env = "IMPORTER_S3_ENDPOINT")]
    pub s3_endpoint: Option<Url>,
}

impl ImporterSettings {
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.access_key.clone(), self.secret_key.clone())
    }

    /// Pipeline config with these settings applied over the defaults.
    pub fn to_config(&self) -> ImporterConfig {
        let mut config = ImporterConfig::default();
        if let Some(depth) = self.max_nesting_depth {
            config.max_nesting_depth = depth;
        }
        if let Some(url) = &self.s3_endpoint {
            config.s3_endpoint = url.clone();
        }
        config
    }

    /// Render the settings as the environment a worker is started with.
    ///
    /// Unset optional settings are left out rather than passed empty.
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("IMPORTER_ENDPOINT", self.endpoint.clone())];
        if let Some(key) = &self.access_key {
            pairs.push(("IMPORTER_ACCESS_KEY_ID", key.clone()));
        }
        if let Some(secret) = &self.secret_key {
            pairs.push(("IMPORTER_SECRET_KEY", secret.clone()));
        }
        pairs.push(("IMPORTER_DEST", self.dest.display().to_string()));
        pairs.push(("IMPORTER_VERBOSITY", self.verbosity.to_string()));
        pairs.push(("IMPORTER_QEMU_IMG", self.qemu_img.display().to_string()));
        if let Some(depth) = self.max_nesting_depth {
            pairs.push(("IMPORTER_NESTING_DEPTH", depth.to_string()));
        }
        if let Some(url) = &self.s3_endpoint {
            pairs.push(("IMPORTER_S3_ENDPOINT", url.to_string()));
        }
        pairs
    }
}

impl fmt::Debug for ImporterSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImporterSettings")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("dest", &self.dest)
            .field("verbosity", &self.verbosity)
            .field("qemu_img", &self.qemu_img)
            .field("max_nesting_depth", &self.max_nesting_depth)
            .field("s3_endpoint", &self.s3_endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        settings: ImporterSettings,
    }

    fn parse(args: &[&str]) -> ImporterSettings {
        let argv = std::iter::once("importer").chain(args.iter().copied());
        TestCli::try_parse_from(argv).unwrap().settings
    }

    #[test]
    fn test_defaults() {
        let config = ImporterConfig::default();
        assert_eq!(config.max_nesting_depth, 4);
        assert_eq!(config.copy_buffer_size, 1 << 20);
        assert_eq!(config.s3_endpoint.as_str(), "https://s3.amazonaws.com/");
        assert!(config.convert);
        assert_eq!(config.target_format, "raw");
    }

    #[test]
    fn test_flags_override_config() {
        let settings = parse(&[
            "--endpoint",
            "s3://bucket/disk.img",
            "--max-nesting-depth",
            "2",
            "--s3-endpoint",
            "http://127.0.0.1:9000",
        ]);
        let config = settings.to_config();
        assert_eq!(config.max_nesting_depth, 2);
        assert_eq!(config.s3_endpoint.as_str(), "http://127.0.0.1:9000/");
        assert_eq!(settings.dest, PathBuf::from(DEFAULT_DEST));
        assert_eq!(settings.verbosity, 1);
    }

    #[test]
    fn test_env_pairs_round_trip_through_parser() {
        let settings = parse(&[
            "--endpoint",
            "https://example.com/disk.qcow2",
            "--access-key",
            "ak",
            "--secret-key",
            "sk",
            "-v",
            "2",
        ]);
        let pairs = settings.env_pairs();
        assert!(pairs.contains(&("IMPORTER_ACCESS_KEY_ID", "ak".to_string())));
        assert!(pairs.contains(&("IMPORTER_VERBOSITY", "2".to_string())));
        assert!(!pairs.iter().any(|(name, _)| *name == "IMPORTER_NESTING_DEPTH"));

        let mut argv = Vec::new();
        for (name, value) in &pairs {
            let flag = match *name {
                "IMPORTER_ENDPOINT" => "--endpoint",
                "IMPORTER_ACCESS_KEY_ID" => "--access-key",
                "IMPORTER_SECRET_KEY" => "--secret-key",
                "IMPORTER_DEST" => "--dest",
                "IMPORTER_VERBOSITY" => "--verbosity",
                "IMPORTER_QEMU_IMG" => "--qemu-img",
                other => panic!("unexpected variable {other}"),
            };
            argv.push(flag.to_string());
            argv.push(value.clone());
        }
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        let reparsed = parse(&argv);
        assert_eq!(reparsed.endpoint, settings.endpoint);
        assert_eq!(reparsed.credentials(), settings.credentials());
        assert!(!format!("{reparsed:?}").contains("\"sk\""));
    }
}
