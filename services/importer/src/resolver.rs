//! Opens the raw byte source behind an endpoint.

use std::fs::File;
use std::io;

use chrono::{Duration as ChronoDuration, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use tracing::{debug, info};
use url::Url;

use crate::chain::Closable;
use crate::config::ImporterConfig;
use crate::endpoint::{Credentials, Endpoint, Scheme};
use crate::error::ImportError;
use crate::s3;

/// How long a presigned object-store URL stays valid.
const PRESIGN_TTL_SECS: i64 = 3600;

/// Maps endpoints to open byte sources.
#[derive(Debug, Clone)]
pub struct Resolver {
    http: Client,
    s3_endpoint: Url,
}

impl Resolver {
    pub fn new(config: &ImporterConfig) -> Result<Self, ImportError> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ImportError::io("building HTTP client", io::Error::other(e)))?;
        Ok(Self {
            http,
            s3_endpoint: config.s3_endpoint.clone(),
        })
    }

    /// Open `endpoint` for sequential reading.
    ///
    /// Nothing is returned unless the source is actually open, so a failure
    /// here leaves nothing for the caller to close.
    pub fn open(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Closable>, ImportError> {
        match endpoint.scheme() {
            Scheme::File => self.open_file(endpoint),
            Scheme::Http | Scheme::Https => self.open_http(endpoint, credentials),
            Scheme::S3 => self.open_object(endpoint, credentials),
        }
    }

    fn open_file(&self, endpoint: &Endpoint) -> Result<Box<dyn Closable>, ImportError> {
        let path = endpoint
            .local_path()
            .ok_or_else(|| ImportError::unreachable(endpoint.redacted(), "not a local path"))?;
        let file = File::open(&path)
            .map_err(|e| ImportError::unreachable(endpoint.redacted(), e))?;
        debug!(path = %path.display(), "Opened local source");
        Ok(Box::new(file))
    }

    fn open_http(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Closable>, ImportError> {
        let mut request = self.http.get(endpoint.url().clone());
        if let Some(creds) = credentials {
            request = request.basic_auth(creds.access_key(), Some(creds.secret_key()));
        }
        let response = request
            .send()
            .map_err(|e| ImportError::unreachable(endpoint.redacted(), e.without_url()))?;
        let response = check_status(endpoint, response, credentials.is_some())?;
        info!(
            endpoint = %endpoint,
            content_length = response.content_length(),
            "Connected to source"
        );
        Ok(Box::new(response))
    }

    fn open_object(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn Closable>, ImportError> {
        let (bucket, key) = endpoint.bucket_and_key().ok_or_else(|| {
            ImportError::InvalidEndpoint {
                endpoint: endpoint.redacted(),
                reason: "expected s3://<bucket>/<key>".to_string(),
            }
        })?;
        let mut url = s3::object_url(&self.s3_endpoint, bucket, key)?;
        if let Some(creds) = credentials {
            let expires = Utc::now() + ChronoDuration::seconds(PRESIGN_TTL_SECS);
            s3::presign(&mut url, bucket, key, creds, expires)?;
        }
        debug!(bucket, key, "Resolved object-store endpoint");

        let response = self
            .http
            .get(url)
            .send()
            .map_err(|e| ImportError::unreachable(endpoint.redacted(), e.without_url()))?;
        let response = check_status(endpoint, response, credentials.is_some())?;
        info!(
            endpoint = %endpoint,
            content_length = response.content_length(),
            "Connected to object store"
        );
        Ok(Box::new(response))
    }
}

fn check_status(
    endpoint: &Endpoint,
    response: Response,
    authenticated: bool,
) -> Result<Response, ImportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if authenticated && matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(ImportError::AuthFailure(endpoint.redacted()));
    }
    Err(ImportError::unreachable(
        endpoint.redacted(),
        format!("server responded {status}"),
    ))
}
