use reqwest::StatusCode;
use thiserror::Error;

/// Failures talking to the remote authority.
///
/// None of these touch local records. `is_retryable` decides whether the next
/// scheduled sync is worth attempting without the user stepping in.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// 401/403: the token is missing, expired or lacks access.
    #[error("Remote refused the sync credentials (status {status})")]
    Credentials { status: u16 },

    #[error("Configured token cannot be sent as a header")]
    MalformedToken,

    /// 404: usually a wrong `remote_url`.
    #[error("Remote has no endpoint at {url}")]
    MissingEndpoint { url: String },

    #[error("Remote kept throttling after {retries} retries")]
    Throttled { retries: u32 },

    #[error("Remote failed with status {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Remote answered {url} with status {status}: {body}")]
    Unexpected {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Could not reach remote: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Remote reply could not be read: {0}")]
    InvalidResponse(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),
}

/// Response bodies quoted in errors are cut to this many bytes.
const MAX_QUOTED_BODY: usize = 500;

fn quote_body(body: &str) -> String {
    if body.len() <= MAX_QUOTED_BODY {
        return body.to_string();
    }
    let mut end = MAX_QUOTED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes)", &body[..end], body.len())
}

impl RemoteError {
    /// Classify a non-success reply from `url`. 429 is handled by the
    /// client's backoff loop before it gets here.
    pub fn from_status(status: StatusCode, url: &str, body: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Credentials {
                status: status.as_u16(),
            },
            StatusCode::NOT_FOUND => RemoteError::MissingEndpoint {
                url: url.to_string(),
            },
            s if s.is_server_error() => RemoteError::Server {
                status: s.as_u16(),
                body: quote_body(body),
            },
            s => RemoteError::Unexpected {
                url: url.to_string(),
                status: s.as_u16(),
                body: quote_body(body),
            },
        }
    }

    /// Whether the next sync cycle may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RemoteError::Credentials { .. }
                | RemoteError::MalformedToken
                | RemoteError::MissingEndpoint { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_mapping() {
        let url = "https://lessons.example/api/progress";
        assert!(matches!(
            RemoteError::from_status(StatusCode::FORBIDDEN, url, "no"),
            RemoteError::Credentials { status: 403 }
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::NOT_FOUND, url, ""),
            RemoteError::MissingEndpoint { url: ref u } if u == url
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::BAD_GATEWAY, url, "upstream"),
            RemoteError::Server { status: 502, ref body } if body == "upstream"
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::IM_A_TEAPOT, url, "tea"),
            RemoteError::Unexpected { status: 418, .. }
        ));
    }

    #[test]
    fn test_long_bodies_are_cut_on_char_boundary() {
        let long = "é".repeat(MAX_QUOTED_BODY);
        let quoted = quote_body(&long);
        assert!(quoted.ends_with(&format!("({} bytes)", long.len())));
        assert!(quoted.len() < long.len());
        assert_eq!(quote_body("short"), "short");
    }

    #[test]
    fn test_retryable() {
        assert!(RemoteError::Throttled { retries: 3 }.is_retryable());
        assert!(RemoteError::Unavailable("down".into()).is_retryable());
        assert!(!RemoteError::Credentials { status: 401 }.is_retryable());
        assert!(!RemoteError::MissingEndpoint { url: "x".into() }.is_retryable());
    }
}
