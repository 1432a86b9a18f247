//! Revision lookups against the channel status server.
//!
//! Each channel publishes its current git revision as a small plain-text
//! document at `/channels/{channel}/git-revision`. The response may carry a
//! `Last-Modified` header telling when the channel last advanced.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::LAST_MODIFIED;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::config::UpstreamConfig;

/// Default channel status server.
pub const DEFAULT_BASE_URL: &str = "https://nixos.org/";

/// Default timeout for a single revision request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the number of body bytes read as the revision.
pub const MAX_REVISION_LEN: usize = 128;

/// Errors produced while fetching a channel revision.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to HTTP GET channel revision: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("unexpected response: HTTP {status}")]
    UnexpectedStatus { status: StatusCode },

    #[error("malformed Last-Modified header: {value:?}")]
    MalformedTimestamp { value: String },

    #[error("failed to read HTTP channel revision body: {0}")]
    Read(#[source] reqwest::Error),

    #[error("deadline of {0:?} elapsed before the request completed")]
    Timeout(Duration),

    #[error("request cancelled after another channel failed")]
    Cancelled,
}

/// The outcome of one successful revision lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Channel name the revision belongs to.
    pub channel: String,
    /// Revision identifier, at most [`MAX_REVISION_LEN`] bytes of the body.
    pub revision: String,
    /// Parsed `Last-Modified` header, if the server sent one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Fetches channel revisions from a channel status server.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct RevisionFetcher {
    base: Url,
    client: reqwest::Client,
}

impl RevisionFetcher {
    /// Create a fetcher with its own HTTP client.
    ///
    /// An empty `base_url` selects [`DEFAULT_BASE_URL`].
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(FetchError::Client)?;

        Self::with_client(base_url, client)
    }

    /// Create a fetcher from upstream settings.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, FetchError> {
        Self::new(
            &config.base_url,
            config.request_timeout(),
            &config.user_agent,
        )
    }

    /// Create a fetcher that uses a caller-supplied HTTP client.
    pub fn with_client(base_url: &str, client: reqwest::Client) -> Result<Self, FetchError> {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };

        let base = parse_base_url(base_url)?;
        Ok(Self { base, client })
    }

    /// Base URL revision paths are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// URL of the revision document for `channel`.
    ///
    /// The channel name is percent-encoded as a single path segment.
    pub fn revision_url(&self, channel: &str) -> Url {
        let mut url = self.base.clone();
        // The base URL was checked to be hierarchical, so this cannot fail.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.clear().extend(["channels", channel, "git-revision"]);
        }
        url
    }

    /// Perform one GET for the revision of `channel`.
    pub async fn fetch(&self, channel: &str) -> Result<FetchResult, FetchError> {
        let url = self.revision_url(channel);
        trace!(channel, url = %url, "Fetching channel revision");

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::UnexpectedStatus { status });
        }

        let last_modified = match response.headers().get(LAST_MODIFIED) {
            Some(value) => {
                let raw = String::from_utf8_lossy(value.as_bytes()).into_owned();
                match parse_http_date(&raw) {
                    Some(parsed) => Some(parsed),
                    None => return Err(FetchError::MalformedTimestamp { value: raw }),
                }
            }
            None => None,
        };

        let mut body = Vec::with_capacity(MAX_REVISION_LEN);
        while body.len() < MAX_REVISION_LEN {
            let Some(chunk) = response.chunk().await.map_err(FetchError::Read)? else {
                break;
            };
            let take = chunk.len().min(MAX_REVISION_LEN - body.len());
            body.extend_from_slice(&chunk[..take]);
        }

        let revision = decode_revision(&body);
        debug!(channel, revision = %revision, ?last_modified, "Fetched channel revision");

        Ok(FetchResult {
            channel: channel.to_string(),
            revision,
            last_modified,
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, FetchError> {
    let invalid = |reason: String| FetchError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("URL cannot be used as a base".to_string()));
    }

    Ok(url)
}

/// Decode the revision body, dropping a character split by the length cap.
fn decode_revision(body: &[u8]) -> String {
    let body = match std::str::from_utf8(body) {
        Err(e) if e.error_len().is_none() => &body[..e.valid_up_to()],
        _ => body,
    };

    let mut revision = String::from_utf8_lossy(body).into_owned();
    // Replacement characters are wider than the bytes they stand for.
    if revision.len() > MAX_REVISION_LEN {
        let mut end = MAX_REVISION_LEN;
        while !revision.is_char_boundary(end) {
            end -= 1;
        }
        revision.truncate(end);
    }
    revision
}

/// Parse an HTTP date as found in `Last-Modified`.
///
/// Accepts the preferred IMF-fixdate form (`Sun, 06 Nov 1994 08:49:37 GMT`)
/// and the obsolete RFC 850 and asctime forms. Anything else, including
/// numeric offsets and other zone names, is rejected.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    // Fixed-width forms carry their exact length.
    const FORMATS: [(&str, Option<usize>); 3] = [
        // IMF-fixdate: Sun, 06 Nov 1994 08:49:37 GMT
        ("%a, %d %b %Y %H:%M:%S GMT", Some(29)),
        // RFC 850: Sunday, 06-Nov-94 08:49:37 GMT
        ("%A, %d-%b-%y %H:%M:%S GMT", None),
        // asctime: Sun Nov  6 08:49:37 1994
        ("%a %b %e %H:%M:%S %Y", Some(24)),
    ];

    let value = value.trim();
    FORMATS
        .iter()
        .filter(|(_, len)| len.is_none_or(|width| value.len() == width))
        .find_map(|(format, _)| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(base: &str) -> RevisionFetcher {
        RevisionFetcher::with_client(base, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn test_default_base_url() {
        let fetcher = fetcher("");
        assert_eq!(fetcher.base_url().as_str(), "https://nixos.org/");
    }

    #[test]
    fn test_revision_url() {
        let fetcher = fetcher("https://nixos.org/");
        assert_eq!(
            fetcher.revision_url("nixos-unstable").as_str(),
            "https://nixos.org/channels/nixos-unstable/git-revision"
        );
    }

    #[test]
    fn test_revision_url_replaces_base_path() {
        let fetcher = fetcher("http://127.0.0.1:8080/some/prefix");
        assert_eq!(
            fetcher.revision_url("nixos-24.05").as_str(),
            "http://127.0.0.1:8080/channels/nixos-24.05/git-revision"
        );
    }

    #[test]
    fn test_revision_url_escapes_channel() {
        let fetcher = fetcher("https://nixos.org/");
        let url = fetcher.revision_url("odd/name?x");
        assert_eq!(url.path(), "/channels/odd%2Fname%3Fx/git-revision");
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_invalid_base_url() {
        let result = RevisionFetcher::with_client("not a url", reqwest::Client::new());
        assert!(matches!(result, Err(FetchError::InvalidBaseUrl { .. })));
    }

    #[test]
    fn test_unsupported_scheme() {
        let result = RevisionFetcher::with_client("ftp://nixos.org/", reqwest::Client::new());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_parse_http_date_imf_fixdate() {
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(parsed.timestamp(), 784_111_777);
    }

    #[test]
    fn test_parse_http_date_rfc850() {
        let parsed = parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").unwrap();
        assert_eq!(parsed.timestamp(), 784_111_777);
    }

    #[test]
    fn test_parse_http_date_asctime() {
        let parsed = parse_http_date("Wed Nov 16 08:49:37 1994").unwrap();
        assert_eq!(parsed.timestamp(), 784_111_777 + 10 * 86_400);
    }

    #[test]
    fn test_parse_http_date_asctime_padded_day() {
        let parsed = parse_http_date("Sun Nov  6 08:49:37 1994").unwrap();
        assert_eq!(parsed.timestamp(), 784_111_777);
    }

    #[test]
    fn test_parse_http_date_malformed() {
        assert!(parse_http_date("yesterday").is_none());
        assert!(parse_http_date("").is_none());
    }

    #[test]
    fn test_parse_http_date_rejects_non_http_forms() {
        for value in [
            // numeric offset
            "Sun, 06 Nov 1994 08:49:37 +0200",
            // zone other than GMT
            "Sun, 06 Nov 1994 08:49:37 EST",
            // no zone
            "Sun, 06 Nov 1994 08:49:37",
            // missing weekday
            "06 Nov 1994 08:49:37 GMT",
            // two-digit year
            "Sun, 06 Nov 94 08:49:37 GMT",
            // missing seconds
            "Sun, 06 Nov 1994 08:49 GMT",
        ] {
            assert!(parse_http_date(value).is_none(), "accepted {value:?}");
        }
    }

    #[test]
    fn test_decode_revision_ascii() {
        assert_eq!(decode_revision(b"abc123"), "abc123");
    }

    #[test]
    fn test_decode_revision_drops_split_character() {
        let mut body = vec![b'a'; MAX_REVISION_LEN - 1];
        // First byte of a two-byte sequence, cut by the cap.
        body.push(0xC3);

        let revision = decode_revision(&body);
        assert_eq!(revision, "a".repeat(MAX_REVISION_LEN - 1));
    }

    #[test]
    fn test_decode_revision_stays_within_cap() {
        let body = vec![0xFF; MAX_REVISION_LEN];

        let revision = decode_revision(&body);
        assert!(revision.len() <= MAX_REVISION_LEN);
        assert!(revision.chars().all(|c| c == char::REPLACEMENT_CHARACTER));
    }
}
