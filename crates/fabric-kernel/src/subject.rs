//! The bus subject codec: a bijection between a wire subject string and the
//! `(reversedHost, port, method, pathSegments*)` tuple an HTTP-shaped request
//! actually addresses.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use thiserror::Error;

const SUBJECT_DELIMITER: char = '.';
const WILDCARD_ONE: &str = "*";
const WILDCARD_TAIL: &str = ">";

/// Characters a path segment must have percent-encoded; everything else
/// (unreserved plus the path-safe sub-delims) passes through untouched, so
/// that `encode(decode(x)) == x` holds per segment.
const SEGMENT_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'.')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`');

/// Errors raised while constructing, encoding, or decoding a [`Subject`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubjectError {
    /// The host contains an empty label (e.g. a leading, trailing, or
    /// doubled dot).
    #[error("host '{0}' has an empty label")]
    EmptyHostLabel(String),
    /// A label in the host, or a path segment, contains the subject
    /// delimiter and would corrupt the wire encoding.
    #[error("'{0}' contains the reserved subject delimiter '.'")]
    ReservedDelimiter(String),
    /// A wildcard segment (`*` or `>`) appeared in a publication subject.
    #[error("wildcard segment '{0}' is not permitted in a publication")]
    WildcardInPublication(String),
    /// A tail wildcard (`>`) appeared somewhere other than the last segment.
    #[error("tail wildcard '>' must be the last path segment")]
    TailWildcardNotLast,
    /// The method was neither uppercase ASCII nor the `ANY` wildcard.
    #[error("method '{0}' must be uppercase or the wildcard ANY")]
    InvalidMethod(String),
    /// A subject wire string was malformed (too few fields).
    #[error("malformed subject string: '{0}'")]
    MalformedSubject(String),
    /// A port field failed to parse as `u16`.
    #[error("invalid port in subject string: '{0}'")]
    InvalidPort(String),
    /// A host:port/route internal URL was malformed.
    #[error("malformed internal url: '{0}'")]
    MalformedUrl(String),
}

/// Whether a [`Subject`] is being constructed for publication (no wildcards
/// permitted) or subscription (wildcards permitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectKind {
    /// A concrete address a message is sent to; no wildcard segments.
    Publication,
    /// A pattern a subscriber registers against; wildcards permitted.
    Subscription,
}

/// The wildcard that matches exactly one path segment, permitted only in
/// subscriptions.
pub const ANY_SEGMENT: &str = WILDCARD_ONE;
/// The wildcard that matches the remainder of the path, permitted only in
/// subscriptions and only as the final segment.
pub const TAIL_SEGMENTS: &str = WILDCARD_TAIL;

/// `(reversedHost, port, method, pathSegments*)`.
///
/// Host labels are stored in reversed order internally (organizational
/// suffix first) so hierarchical bus wildcards match by suffix; use
/// [`Subject::host`] to recover the original dotted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    reversed_host_labels: Vec<String>,
    port: u16,
    method: String,
    path_segments: Vec<String>,
    /// Whether the original path ended in `/`, denoting a directory
    /// subscription rather than a leaf endpoint.
    trailing_slash: bool,
}

impl Subject {
    /// Build a new subject, validating host labels, method, and path
    /// segments against `kind`.
    pub fn new(
        kind: SubjectKind,
        host: &str,
        port: u16,
        method: &str,
        path: &str,
    ) -> Result<Self, SubjectError> {
        let reversed_host_labels = reverse_host_labels(host)?;
        let method = validate_method(method)?;
        let (path_segments, trailing_slash) = split_path_segments(path, kind)?;
        Ok(Self {
            reversed_host_labels,
            port,
            method,
            path_segments,
            trailing_slash,
        })
    }

    /// Decode a subject from its wire string representation.
    pub fn decode(wire: &str) -> Result<Self, SubjectError> {
        let mut fields = wire.split(SUBJECT_DELIMITER);
        let host_field = fields
            .next()
            .ok_or_else(|| SubjectError::MalformedSubject(wire.to_string()))?;
        let port_field = fields
            .next()
            .ok_or_else(|| SubjectError::MalformedSubject(wire.to_string()))?;
        let method_field = fields
            .next()
            .ok_or_else(|| SubjectError::MalformedSubject(wire.to_string()))?;
        let port: u16 = port_field
            .parse()
            .map_err(|_| SubjectError::InvalidPort(port_field.to_string()))?;
        let method = validate_method(method_field)?;

        let rest: Vec<&str> = fields.collect();
        let trailing_slash = rest.last().is_some_and(|s| s.is_empty()) && !rest.is_empty();
        let path_segments: Vec<String> = rest
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        // host_field is already reversed-label form on the wire; split it
        // directly without re-reversing.
        let reversed_host_labels: Vec<String> = host_field
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        if reversed_host_labels.is_empty() {
            return Err(SubjectError::EmptyHostLabel(wire.to_string()));
        }

        Ok(Self {
            reversed_host_labels,
            port,
            method,
            path_segments,
            trailing_slash,
        })
    }

    /// Encode this subject to its wire string representation.
    ///
    /// Host labels (already reversed) are joined by `/` to keep them
    /// visually distinct from the `.`-delimited subject fields.
    pub fn encode(&self) -> String {
        let host = self.reversed_host_labels.join("/");
        let mut out = format!("{host}{SUBJECT_DELIMITER}{}{SUBJECT_DELIMITER}{}", self.port, self.method);
        for seg in &self.path_segments {
            out.push(SUBJECT_DELIMITER);
            out.push_str(seg);
        }
        if self.trailing_slash {
            out.push(SUBJECT_DELIMITER);
        }
        out
    }

    /// The original, unreversed, dot-joined host.
    pub fn host(&self) -> String {
        self.reversed_host_labels
            .iter()
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join(".")
    }

    /// The reversed, dot-joined host (organizational-suffix-first form).
    pub fn reversed_host(&self) -> String {
        self.reversed_host_labels.join(".")
    }

    /// The port; `0` means "any".
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The method, uppercase or the `ANY` wildcard.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Percent-decoded, normalized path segments.
    pub fn path_segments(&self) -> &[String] {
        &self.path_segments
    }

    /// The path, `/`-joined, with percent-decoded segments re-encoded for
    /// transport back into an HTTP-shaped route.
    pub fn path(&self) -> String {
        let mut out = String::new();
        for seg in &self.path_segments {
            out.push('/');
            out.push_str(&utf8_percent_encode(seg, SEGMENT_ENCODE_SET).to_string());
        }
        if self.trailing_slash {
            out.push('/');
        } else if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Whether this subject denotes a directory subscription (trailing `/`).
    pub fn is_directory(&self) -> bool {
        self.trailing_slash
    }

    /// Whether any path segment is a wildcard (`*` or `>`).
    pub fn has_wildcard(&self) -> bool {
        self.path_segments
            .iter()
            .any(|s| s == WILDCARD_ONE || s == WILDCARD_TAIL)
            || self.method == "ANY"
    }
}

fn reverse_host_labels(host: &str) -> Result<Vec<String>, SubjectError> {
    if host.is_empty() {
        return Err(SubjectError::EmptyHostLabel(host.to_string()));
    }
    let labels: Vec<&str> = host.split('.').collect();
    for label in &labels {
        if label.is_empty() {
            return Err(SubjectError::EmptyHostLabel(host.to_string()));
        }
        if label.contains(SUBJECT_DELIMITER) {
            return Err(SubjectError::ReservedDelimiter(label.to_string()));
        }
    }
    Ok(labels.iter().rev().map(|s| s.to_string()).collect())
}

fn validate_method(method: &str) -> Result<String, SubjectError> {
    if method == "ANY" {
        return Ok(method.to_string());
    }
    if !method.is_empty() && method.chars().all(|c| c.is_ascii_uppercase()) {
        return Ok(method.to_string());
    }
    Err(SubjectError::InvalidMethod(method.to_string()))
}

fn split_path_segments(
    path: &str,
    kind: SubjectKind,
) -> Result<(Vec<String>, bool), SubjectError> {
    let trailing_slash = path.ends_with('/') && path.len() > 1 || path == "/";
    let raw_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let mut segments = Vec::with_capacity(raw_segments.len());
    for (i, raw) in raw_segments.iter().enumerate() {
        if *raw == WILDCARD_TAIL {
            if kind == SubjectKind::Publication {
                return Err(SubjectError::WildcardInPublication(raw.to_string()));
            }
            if i != raw_segments.len() - 1 {
                return Err(SubjectError::TailWildcardNotLast);
            }
            segments.push(raw.to_string());
            continue;
        }
        if *raw == WILDCARD_ONE {
            if kind == SubjectKind::Publication {
                return Err(SubjectError::WildcardInPublication(raw.to_string()));
            }
            segments.push(raw.to_string());
            continue;
        }
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| SubjectError::MalformedSubject(raw.to_string()))?
            .to_string();
        if decoded.contains(SUBJECT_DELIMITER) {
            return Err(SubjectError::ReservedDelimiter(decoded));
        }
        segments.push(decoded);
    }
    Ok((segments, trailing_slash))
}

/// Join a host (optionally `host:port`) and an HTTP route into an internal
/// URL string, e.g. `joinHostAndPath("svc:555", "/x") == "svc:555/x"`.
pub fn join_host_and_path(host: &str, route: &str) -> String {
    let route = if route.starts_with('/') {
        route.to_string()
    } else {
        format!("/{route}")
    };
    format!("{host}{route}")
}

/// Split an internal URL's path (e.g. `/svc:555/x`) into `(host, port,
/// route)`. `port` is `None` when the host segment carries no `:port`
/// suffix. The route is returned with its segments percent-decoded.
pub fn split_host_from_path(path: &str) -> Result<(String, Option<u16>, String), SubjectError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let mut parts = trimmed.splitn(2, '/');
    let host_part = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SubjectError::MalformedUrl(path.to_string()))?;
    let route_part = parts.next().unwrap_or("");

    let (host, port) = match host_part.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| SubjectError::InvalidPort(p.to_string()))?;
            (h.to_string(), Some(port))
        }
        None => (host_part.to_string(), None),
    };

    let mut route = String::new();
    for raw in route_part.split('/').filter(|s| !s.is_empty()) {
        route.push('/');
        let decoded = percent_decode_str(raw)
            .decode_utf8()
            .map_err(|_| SubjectError::MalformedUrl(raw.to_string()))?;
        route.push_str(&decoded);
    }
    if route.is_empty() {
        route.push('/');
    }

    Ok((host, port, route))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_reversed_on_the_wire() {
        let subj = Subject::new(SubjectKind::Publication, "control.core", 443, "GET", "/ping").unwrap();
        assert_eq!(subj.reversed_host(), "core.control");
        assert_eq!(subj.host(), "control.core");
    }

    #[test]
    fn decode_of_encode_round_trips() {
        let subj = Subject::new(
            SubjectKind::Publication,
            "widgets.svc",
            443,
            "POST",
            "/widgets/1",
        )
        .unwrap();
        let wire = subj.encode();
        let decoded = Subject::decode(&wire).unwrap();
        assert_eq!(subj, decoded);
    }

    #[test]
    fn publication_rejects_wildcards() {
        let err = Subject::new(SubjectKind::Publication, "svc", 443, "GET", "/widgets/*").unwrap_err();
        assert_eq!(err, SubjectError::WildcardInPublication("*".to_string()));
    }

    #[test]
    fn subscription_allows_tail_wildcard_only_at_end() {
        let ok = Subject::new(SubjectKind::Subscription, "svc", 443, "GET", "/widgets/>");
        assert!(ok.is_ok());
        let err = Subject::new(SubjectKind::Subscription, "svc", 443, "GET", "/widgets/>/extra").unwrap_err();
        assert_eq!(err, SubjectError::TailWildcardNotLast);
    }

    #[test]
    fn method_must_be_uppercase_or_any() {
        assert!(Subject::new(SubjectKind::Publication, "svc", 443, "ANY", "/x").is_ok());
        assert!(Subject::new(SubjectKind::Publication, "svc", 443, "get", "/x").is_err());
    }

    #[test]
    fn repeated_slashes_normalize_away() {
        let subj = Subject::new(SubjectKind::Publication, "svc", 443, "GET", "//widgets//1").unwrap();
        assert_eq!(subj.path_segments(), &["widgets".to_string(), "1".to_string()]);
    }

    #[test]
    fn rejects_segment_with_reserved_delimiter() {
        let err = Subject::new(SubjectKind::Publication, "svc", 443, "GET", "/a.b").unwrap_err();
        assert!(matches!(err, SubjectError::ReservedDelimiter(_)));
    }

    #[test]
    fn join_and_split_host_and_path_round_trip() {
        let url = join_host_and_path("svc:555", "/x");
        assert_eq!(url, "svc:555/x");
        let (host, port, route) = split_host_from_path(&format!("/{url}")).unwrap();
        assert_eq!(host, "svc");
        assert_eq!(port, Some(555));
        assert_eq!(route, "/x");
    }

    #[test]
    fn split_host_from_path_without_port() {
        let (host, port, route) = split_host_from_path("/svc/x").unwrap();
        assert_eq!(host, "svc");
        assert_eq!(port, None);
        assert_eq!(route, "/x");
    }

    #[test]
    fn directory_subscription_keeps_trailing_slash() {
        let subj = Subject::new(SubjectKind::Subscription, "svc", 443, "GET", "/widgets/").unwrap();
        assert!(subj.is_directory());
        assert_eq!(subj.path(), "/widgets/");
    }
}
