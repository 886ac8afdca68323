use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::ChannelReference;
use crate::error::{Error, Result};
use crate::oauth::OAuthProvider;
use crate::token::TokenManager;

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

/// Channel details from `channels.list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub custom_url: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Playlist holding every public upload.
    pub uploads_playlist_id: Option<String>,
    pub canonical_url: String,
}

#[derive(Deserialize)]
struct ChannelListResponse {
    #[serde(default)]
    items: Vec<ChannelResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResource {
    id: String,
    #[serde(default)]
    snippet: Snippet,
    #[serde(default)]
    content_details: Option<ContentDetails>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    custom_url: Option<String>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Default, Deserialize)]
struct Thumbnails {
    high: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentDetails {
    related_playlists: Option<RelatedPlaylists>,
}

#[derive(Deserialize)]
struct RelatedPlaylists {
    uploads: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Authenticated YouTube Data API client.
pub struct YouTubeClient<P> {
    tokens: TokenManager<P>,
    http: reqwest::Client,
    api_base: String,
}

impl<P: OAuthProvider> YouTubeClient<P> {
    pub fn new(tokens: TokenManager<P>) -> Self {
        Self {
            tokens,
            http: reqwest::Client::new(),
            api_base: YOUTUBE_API_BASE.into(),
        }
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn tokens(&self) -> &TokenManager<P> {
        &self.tokens
    }

    /// Look up a channel. A 401 forces one token refresh and one retry.
    pub async fn lookup_channel(&self, reference: &ChannelReference) -> Result<ChannelSummary> {
        info!(%reference, "looking up channel");
        let token = self.tokens.ensure_valid(false).await?;
        let mut response = self.channels_list(&token, reference).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("access token rejected, forcing refresh");
            let token = self.tokens.ensure_valid(true).await?;
            response = self.channels_list(&token, reference).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or_else(|_| body.trim().to_string());
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        let list: ChannelListResponse = response.json().await?;
        let channel = list
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::ChannelNotFound(reference.canonical_url.clone()))?;
        debug!(id = %channel.id, "channel resolved");
        Ok(summarize(channel))
    }

    async fn channels_list(
        &self,
        token: &str,
        reference: &ChannelReference,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/channels", self.api_base.trim_end_matches('/'));
        Ok(self
            .http
            .get(url)
            .bearer_auth(token)
            .query(&[
                ("part", "snippet,contentDetails"),
                (reference.lookup.api_param(), reference.value.as_str()),
                ("maxResults", "1"),
            ])
            .send()
            .await?)
    }
}

fn summarize(channel: ChannelResource) -> ChannelSummary {
    let thumbs = channel.snippet.thumbnails;
    let thumbnail_url = thumbs
        .high
        .or(thumbs.medium)
        .or(thumbs.default)
        .map(|t| t.url);
    ChannelSummary {
        canonical_url: format!("https://www.youtube.com/channel/{}", channel.id),
        id: channel.id,
        title: channel.snippet.title,
        description: channel.snippet.description,
        custom_url: channel.snippet.custom_url,
        thumbnail_url,
        uploads_playlist_id: channel
            .content_details
            .and_then(|d| d.related_playlists)
            .and_then(|p| p.uploads),
    }
}
