use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

const CHANNEL_HOSTS: [&str; 3] = ["youtube.com", "www.youtube.com", "m.youtube.com"];
const CANONICAL_BASE: &str = "https://www.youtube.com";
const EXAMPLE_HINT: &str = "provide a YouTube channel URL, for example https://www.youtube.com/@yourhandle";

/// Which `channels.list` filter a reference resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LookupKey {
    ByHandle,
    ById,
    ByUsername,
}

impl LookupKey {
    /// Query parameter name in the YouTube Data API.
    pub fn api_param(self) -> &'static str {
        match self {
            LookupKey::ByHandle => "forHandle",
            LookupKey::ById => "id",
            LookupKey::ByUsername => "forUsername",
        }
    }
}

/// A user-supplied channel locator, normalized for the Data API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReference {
    pub lookup: LookupKey,
    pub value: String,
    pub canonical_url: String,
}

impl ChannelReference {
    fn handle(handle: &str) -> Result<Self> {
        let handle = handle.trim().trim_end_matches('/');
        if handle.is_empty() {
            return Err(Error::InvalidReference("channel handle is empty".into()));
        }
        Ok(Self {
            lookup: LookupKey::ByHandle,
            value: handle.to_string(),
            canonical_url: format!("{CANONICAL_BASE}/@{handle}"),
        })
    }
}

impl fmt::Display for ChannelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.lookup.api_param(), self.value)
    }
}

/// Parse `@handle`, `/@handle`, `/channel/<id>`, `/user/<name>` and `/c/<name>`
/// forms on youtube.com hosts.
pub fn parse_channel_reference(raw: &str) -> Result<ChannelReference> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidReference("channel URL is required".into()));
    }

    if let Some(handle) = raw.strip_prefix('@') {
        return ChannelReference::handle(handle);
    }

    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw.trim_start_matches('/'))
    };
    let parsed = Url::parse(&candidate).map_err(|_| Error::InvalidReference(EXAMPLE_HINT.into()))?;

    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    if !CHANNEL_HOSTS.contains(&host.as_str()) {
        return Err(Error::InvalidReference(format!(
            "unsupported host '{host}' — {EXAMPLE_HINT}"
        )));
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let unsupported = || Error::UnsupportedReference(raw.to_string());

    match segments.as_slice() {
        [first, ..] if first.starts_with('@') => ChannelReference::handle(&first[1..]),
        ["channel", id, ..] => Ok(ChannelReference {
            lookup: LookupKey::ById,
            value: id.to_string(),
            canonical_url: format!("{CANONICAL_BASE}/channel/{id}"),
        }),
        [kind @ ("user" | "c"), name, ..] => Ok(ChannelReference {
            lookup: LookupKey::ByUsername,
            value: name.to_string(),
            canonical_url: format!("{CANONICAL_BASE}/{kind}/{name}"),
        }),
        _ => Err(unsupported()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_handle_and_url_handle_agree() {
        let bare = parse_channel_reference("@nba").unwrap();
        let url = parse_channel_reference("https://www.youtube.com/@nba").unwrap();
        assert_eq!(bare, url);
        assert_eq!(bare.lookup, LookupKey::ByHandle);
        assert_eq!(bare.value, "nba");
        assert_eq!(bare.canonical_url, "https://www.youtube.com/@nba");
    }

    #[test]
    fn test_handle_trailing_slashes_stripped() {
        let r = parse_channel_reference("@nba///").unwrap();
        assert_eq!(r.value, "nba");
        let r = parse_channel_reference("youtube.com/@nba/videos").unwrap();
        assert_eq!(r.value, "nba");
    }

    #[test]
    fn test_empty_handle_rejected() {
        assert!(matches!(
            parse_channel_reference("@/"),
            Err(Error::InvalidReference(_))
        ));
        assert!(matches!(
            parse_channel_reference("https://youtube.com/@"),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn test_channel_id_form() {
        let r = parse_channel_reference("https://m.youtube.com/channel/UC123abc").unwrap();
        assert_eq!(r.lookup, LookupKey::ById);
        assert_eq!(r.value, "UC123abc");
        assert_eq!(r.canonical_url, "https://www.youtube.com/channel/UC123abc");
        assert_eq!(r.lookup.api_param(), "id");
    }

    #[test]
    fn test_user_and_c_forms() {
        let r = parse_channel_reference("www.youtube.com/user/someone").unwrap();
        assert_eq!(r.lookup, LookupKey::ByUsername);
        assert_eq!(r.canonical_url, "https://www.youtube.com/user/someone");

        let r = parse_channel_reference("https://YouTube.com/c/Legacy").unwrap();
        assert_eq!(r.value, "Legacy");
        assert_eq!(r.canonical_url, "https://www.youtube.com/c/Legacy");
        assert_eq!(r.lookup.api_param(), "forUsername");
    }

    #[test]
    fn test_unrecognized_host_rejected() {
        let err = parse_channel_reference("https://example.com/@nba").unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
        assert!(err.to_string().contains("unsupported host"));
    }

    #[test]
    fn test_unsupported_paths() {
        for raw in [
            "https://www.youtube.com/",
            "https://www.youtube.com/watch?v=abc",
            "https://www.youtube.com/channel",
            "https://www.youtube.com/user",
        ] {
            assert!(
                matches!(parse_channel_reference(raw), Err(Error::UnsupportedReference(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_blank_input_rejected() {
        assert!(matches!(
            parse_channel_reference("   "),
            Err(Error::InvalidReference(_))
        ));
    }
}
