//! Error types for the import pipeline.

use std::io;

use thiserror::Error;

use crate::converter::ConverterError;

/// Import errors with standardized reason codes.
///
/// Every stage returns the most specific variant it can and the attempt is
/// aborted; nothing in the pipeline retries.
#[derive(Debug, Error)]
pub enum ImportError {
    /// Endpoint string is empty or not a URL.
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Endpoint scheme is not one of file, http, https, s3.
    #[error("unsupported endpoint scheme {0:?}")]
    UnsupportedScheme(String),

    /// Could not open or connect to the endpoint.
    #[error("endpoint unreachable: {endpoint}: {detail}")]
    EndpointUnreachable { endpoint: String, detail: String },

    /// Credentials were supplied but the endpoint rejected them.
    #[error("authentication rejected by {0}")]
    AuthFailure(String),

    /// Unrecognized or corrupt header, nesting too deep, or multi-entry archive.
    #[error("format error: {0}")]
    Format(String),

    /// Short read or write against the chain or the destination.
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The external converter failed.
    #[error("conversion failed: {0}")]
    Convert(#[source] ConverterError),

    /// The converted output does not have the expected shape.
    #[error("validation failed: {0}")]
    Validate(#[source] ConverterError),
}

impl ImportError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ImportError::InvalidEndpoint { .. } => "invalid_endpoint",
            ImportError::UnsupportedScheme(_) => "unsupported_scheme",
            ImportError::EndpointUnreachable { .. } => "endpoint_unreachable",
            ImportError::AuthFailure(_) => "auth_failure",
            ImportError::Format(_) => "format_error",
            ImportError::Io { .. } => "io_error",
            ImportError::Convert(_) => "convert_error",
            ImportError::Validate(_) => "validate_error",
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ImportError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn unreachable(endpoint: impl Into<String>, detail: impl ToString) -> Self {
        ImportError::EndpointUnreachable {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }

    /// Classify an error returned while reading from the decode chain.
    ///
    /// Decoders report corrupt input as `InvalidData`; the tar stage reports
    /// archive-shape problems as a [`FormatViolation`]. Both become
    /// [`ImportError::Format`]; anything else is plain I/O.
    pub(crate) fn from_chain_read(context: &str, err: io::Error) -> Self {
        if let Some(violation) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<FormatViolation>())
        {
            return ImportError::Format(violation.0.clone());
        }
        if err.kind() == io::ErrorKind::InvalidData {
            return ImportError::Format(format!("{context}: {err}"));
        }
        ImportError::io(context, err)
    }
}

/// An archive-shape problem found while streaming, carried through `io::Read`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct FormatViolation(pub String);

impl FormatViolation {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<FormatViolation> for io::Error {
    fn from(violation: FormatViolation) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, violation)
    }
}

/// Log an error and its source chain, then print a one-line summary on stderr.
///
/// The summary is `error: <reason_code>: <message>`; errors that did not come
/// from the pipeline use the `internal` code.
pub fn print_error(err: &anyhow::Error) {
    let reason = err
        .downcast_ref::<ImportError>()
        .map(ImportError::reason_code)
        .unwrap_or("internal");

    tracing::error!(reason, error = %err, "worker failed");
    for cause in err.chain().skip(1) {
        tracing::error!(cause = %cause, "caused by");
    }
    eprintln!("error: {reason}: {err:#}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_violation_survives_io_error() {
        let err: io::Error = FormatViolation::new("archive holds more than one file").into();
        match ImportError::from_chain_read("reading chain", err) {
            ImportError::Format(msg) => assert_eq!(msg, "archive holds more than one file"),
            other => panic!("expected format error, got {other:?}"),
        }
    }

    #[test]
    fn test_chain_read_classification() {
        let corrupt = io::Error::new(io::ErrorKind::InvalidData, "corrupt xz stream");
        assert_eq!(
            ImportError::from_chain_read("reading chain", corrupt).reason_code(),
            "format_error"
        );

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        assert_eq!(
            ImportError::from_chain_read("reading chain", reset).reason_code(),
            "io_error"
        );
    }

    #[test]
    fn test_reason_code_survives_anyhow() {
        let err = anyhow::Error::from(ImportError::AuthFailure("https://example.com/x.img".into()));
        assert_eq!(
            err.downcast_ref::<ImportError>().map(ImportError::reason_code),
            Some("auth_failure")
        );
    }
}
