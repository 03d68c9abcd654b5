//! Max → Matrix content translation.
//!
//! One Max message can produce several Matrix events: the text first, then
//! one event per attachment. Media that cannot be re-uploaded degrades to a
//! `[<kind>: <url>]` text event instead of being dropped.

use serde_json::Value;

use maxbridge_client::MaxClient;
use maxbridge_core::types::{AttachmentKind, MaxAttachment, MaxMessage};
use maxbridge_matrix::{Intent, MediaInfo, MessageContent, msgtype};

/// One Matrix event ready to send: `(event type, content)`.
pub type MatrixOutgoing = (String, Value);

/// Convert a Max message to a list of Matrix events.
pub async fn max_to_matrix(
    message: &MaxMessage,
    client: &dyn MaxClient,
    intent: &dyn Intent,
) -> Vec<MatrixOutgoing> {
    let mut events = Vec::new();

    if let Some(text) = message.text() {
        if !text.is_empty() {
            let mut content = MessageContent::text(text);
            if text.contains('\n') {
                content = content.with_html(escape_html(text).replace('\n', "<br>"));
            }
            if let Ok(value) = serde_json::to_value(&content) {
                events.push(("m.room.message".to_string(), value));
            }
        }
    }

    for attachment in message.attachments() {
        if let Some(event) = convert_attachment(&attachment, client, intent).await {
            events.push(event);
        }
    }

    events
}

async fn convert_attachment(
    attachment: &MaxAttachment,
    client: &dyn MaxClient,
    intent: &dyn Intent,
) -> Option<MatrixOutgoing> {
    match attachment.kind {
        kind if kind.is_photo() => {
            let url = attachment.best_photo_url()?.to_string();
            match reupload(client, intent, &url, "photo.jpg", "image/jpeg").await {
                Some((mxc, size)) => Some(media_event(
                    msgtype::IMAGE,
                    "photo.jpg",
                    &mxc,
                    "image/jpeg",
                    size,
                )),
                None => Some(text_event(&format!("[photo: {url}]"))),
            }
        }
        AttachmentKind::File => {
            let url = attachment.url.as_deref()?.to_string();
            let filename = attachment.filename.clone().unwrap_or_else(|| "file".to_string());
            let mime = attachment
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            match reupload(client, intent, &url, &filename, &mime).await {
                Some((mxc, size)) => Some(media_event(msgtype::FILE, &filename, &mxc, &mime, size)),
                None => Some(text_event(&format!("[File: {filename}]"))),
            }
        }
        AttachmentKind::Sticker => {
            let url = attachment
                .url
                .as_deref()
                .or_else(|| attachment.best_photo_url())?
                .to_string();
            match reupload(client, intent, &url, "sticker.webp", "image/webp").await {
                Some((mxc, size)) => {
                    let (_, content) =
                        media_event(msgtype::IMAGE, "sticker", &mxc, "image/webp", size);
                    Some(("m.sticker".to_string(), content))
                }
                None => None,
            }
        }
        AttachmentKind::Video | AttachmentKind::Voice | AttachmentKind::Audio => {
            let url = attachment.url.as_deref()?.to_string();
            let target = if attachment.kind == AttachmentKind::Video {
                msgtype::VIDEO
            } else {
                msgtype::AUDIO
            };
            let filename = attachment
                .filename
                .clone()
                .unwrap_or_else(|| format!("{}.bin", attachment.kind.as_str()));
            let mime = attachment
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            match reupload(client, intent, &url, &filename, &mime).await {
                Some((mxc, size)) => Some(media_event(target, &filename, &mxc, &mime, size)),
                None => Some(text_event(&format!(
                    "[{}: {url}]",
                    attachment.kind.as_str()
                ))),
            }
        }
        AttachmentKind::Location => {
            let (lat, lon) = (attachment.latitude?, attachment.longitude?);
            let geo_uri = format!("geo:{lat},{lon}");
            let content = MessageContent {
                msgtype: msgtype::LOCATION.to_string(),
                body: format!("Location: {geo_uri}"),
                geo_uri: Some(geo_uri),
                ..MessageContent::default()
            };
            Some((
                "m.room.message".to_string(),
                serde_json::to_value(&content).ok()?,
            ))
        }
        AttachmentKind::Contact => {
            tracing::debug!("contact attachments are not bridged");
            None
        }
        _ => None,
    }
}

/// Download from Max and upload to the homeserver.
///
/// Returns the `mxc://` URI and content length, or `None` on any failure.
async fn reupload(
    client: &dyn MaxClient,
    intent: &dyn Intent,
    url: &str,
    filename: &str,
    mime: &str,
) -> Option<(String, i64)> {
    let data = match client.download_media(url).await {
        Ok(data) => data,
        Err(error) => {
            tracing::warn!(%error, url, "failed to download Max media");
            return None;
        }
    };
    let size = i64::try_from(data.len()).unwrap_or(0);
    match intent.upload_media(data, mime, filename).await {
        Ok(mxc) => Some((mxc, size)),
        Err(error) => {
            tracing::warn!(%error, "failed to upload media to the homeserver");
            None
        }
    }
}

fn media_event(
    target: &str,
    body: &str,
    mxc: &str,
    mime: &str,
    size: i64,
) -> MatrixOutgoing {
    let content = MessageContent {
        msgtype: target.to_string(),
        body: body.to_string(),
        url: Some(mxc.to_string()),
        info: Some(MediaInfo {
            mimetype: Some(mime.to_string()),
            size: Some(size),
        }),
        ..MessageContent::default()
    };
    (
        "m.room.message".to_string(),
        serde_json::to_value(&content).unwrap_or_default(),
    )
}

fn text_event(body: &str) -> MatrixOutgoing {
    (
        "m.room.message".to_string(),
        serde_json::to_value(MessageContent::text(body)).unwrap_or_default(),
    )
}

/// Escape text for inclusion in an HTML body.
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
