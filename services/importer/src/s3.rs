//! Object-store URL handling.

use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use url::Url;

use crate::endpoint::Credentials;
use crate::error::ImportError;

/// Path-style HTTP URL of `bucket/key` under the object-store base URL.
pub fn object_url(base: &Url, bucket: &str, key: &str) -> Result<Url, ImportError> {
    let joined = format!("{}/{}/{}", base.as_str().trim_end_matches('/'), bucket, key);
    Url::parse(&joined).map_err(|e| ImportError::InvalidEndpoint {
        endpoint: format!("s3://{bucket}/{key}"),
        reason: e.to_string(),
    })
}

/// Add query-string authentication (HMAC-SHA1, signature version 2) to an
/// object URL, valid until `expires`.
pub fn presign(
    url: &mut Url,
    bucket: &str,
    key: &str,
    credentials: &Credentials,
    expires: DateTime<Utc>,
) -> Result<(), ImportError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(credentials.secret_key().as_bytes())
        .map_err(|e| ImportError::AuthFailure(format!("cannot sign request: {e}")))?;
    let string_to_sign = format!("GET\n\n\n{}\n/{}/{}", expires.timestamp(), bucket, key);
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    url.query_pairs_mut()
        .append_pair("AWSAccessKeyId", credentials.access_key())
        .append_pair("Expires", &expires.timestamp().to_string())
        .append_pair("Signature", &signature);
    Ok(())
}
