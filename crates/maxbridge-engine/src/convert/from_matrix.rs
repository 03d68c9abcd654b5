//! Matrix → Max content translation.
//!
//! Max has no HTML: formatted bodies are flattened to the markdown-ish
//! plain text Max users expect, and media is re-uploaded through the Max
//! side with the upload token wrapped in an attachment descriptor.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use maxbridge_client::media::{attachment_payload, check_file_size, guess_mime_type};
use maxbridge_client::MaxClient;
use maxbridge_matrix::{Intent, MessageContent, msgtype};

/// A message ready to send through a Max client.
#[derive(Debug, Clone, Default)]
pub struct MaxOutgoing {
    /// Plain text body.
    pub text: String,
    /// Attachment descriptors.
    pub attachments: Vec<Value>,
}

static BR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<br\s*/?>").unwrap());
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:b|strong)>(.*?)</(?:b|strong)>").unwrap());
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(?:i|em)>(.*?)</(?:i|em)>").unwrap());
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<code>(.*?)</code>").unwrap());
static PRE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<pre>(.*?)</pre>").unwrap());
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<a href="(.*?)">(.*?)</a>"#).unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

/// Flatten a formatted Matrix body to Max plain text.
///
/// Falls back to the plain body when there is no formatted one.
#[must_use]
pub fn html_to_text(body: &str, formatted_body: Option<&str>) -> String {
    let Some(html) = formatted_body else {
        return body.to_string();
    };
    let text = BR.replace_all(html, "\n");
    let text = BOLD.replace_all(&text, "*$1*");
    let text = ITALIC.replace_all(&text, "_$1_");
    let text = CODE.replace_all(&text, "`$1`");
    let text = PRE.replace_all(&text, "```\n$1\n```");
    let text = LINK.replace_all(&text, "$2 ($1)");
    let text = TAG.replace_all(&text, "");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Convert a Matrix message to Max send parameters.
///
/// Media is fetched through the intent (the injected downloader) and
/// re-uploaded through the Max client; on failure the message degrades to a
/// plain-text marker.
pub async fn matrix_to_max(
    content: &MessageContent,
    client: &dyn MaxClient,
    intent: &dyn Intent,
    bot_api: bool,
) -> MaxOutgoing {
    match content.msgtype.as_str() {
        msgtype::TEXT => MaxOutgoing {
            text: html_to_text(&content.body, content.formatted_body.as_deref()),
            attachments: Vec::new(),
        },
        msgtype::NOTICE => MaxOutgoing {
            text: content.body.clone(),
            attachments: Vec::new(),
        },
        msgtype::EMOTE => MaxOutgoing {
            text: format!("* {}", content.body),
            attachments: Vec::new(),
        },
        msgtype::LOCATION => MaxOutgoing {
            text: content
                .geo_uri
                .clone()
                .unwrap_or_else(|| content.body.clone()),
            attachments: Vec::new(),
        },
        msgtype::IMAGE | msgtype::FILE | msgtype::VIDEO | msgtype::AUDIO => {
            convert_media(content, client, intent, bot_api).await
        }
        other => {
            tracing::debug!(msgtype = other, "unsupported matrix msgtype");
            MaxOutgoing {
                text: content.body.clone(),
                attachments: Vec::new(),
            }
        }
    }
}

async fn convert_media(
    content: &MessageContent,
    client: &dyn MaxClient,
    intent: &dyn Intent,
    bot_api: bool,
) -> MaxOutgoing {
    let fallback = || MaxOutgoing {
        text: format!("[Media: {}]", content.body),
        attachments: Vec::new(),
    };
    let Some(url) = content.url.as_deref() else {
        return fallback();
    };
    let filename = if content.body.is_empty() {
        "file".to_string()
    } else {
        content.body.clone()
    };
    let mime = content
        .info
        .as_ref()
        .and_then(|info| info.mimetype.clone())
        .unwrap_or_else(|| guess_mime_type(&filename));

    let data = match intent.download_media(url).await {
        Ok(data) => data,
        Err(error) => {
            tracing::warn!(%error, url, "failed to download matrix media");
            return fallback();
        }
    };
    if let Some(reason) = check_file_size(data.len(), &mime) {
        tracing::warn!(%reason, "media exceeds Max upload limits");
        return fallback();
    }
    match client.upload_media(data, &filename, &mime).await {
        Ok(token) => MaxOutgoing {
            text: String::new(),
            attachments: vec![attachment_payload(&token, &mime, &filename, bot_api)],
        },
        Err(error) => {
            tracing::warn!(%error, "failed to upload media to Max");
            fallback()
        }
    }
}
