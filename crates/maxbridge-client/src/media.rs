//! Media classification and attachment payload helpers.

use serde_json::{Value, json};

/// Maximum photo size accepted by Max uploads.
pub const MAX_PHOTO_SIZE: usize = 50 * 1024 * 1024;
/// Maximum file size accepted by Max uploads.
pub const MAX_FILE_SIZE: usize = 256 * 1024 * 1024;
/// Maximum video size accepted by Max uploads.
pub const MAX_VIDEO_SIZE: usize = 256 * 1024 * 1024;

/// Map a MIME type to the Max upload type query parameter.
#[must_use]
pub fn upload_type_for(content_type: &str) -> &'static str {
    if content_type.starts_with("image/") {
        "photo"
    } else if content_type.starts_with("video/") {
        "video"
    } else if content_type.starts_with("audio/") {
        "audio"
    } else {
        "file"
    }
}

/// Guess a MIME type from a filename.
#[must_use]
pub fn guess_mime_type(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Check an upload against the Max size limits.
///
/// Returns a human-readable rejection reason, or `None` if acceptable.
#[must_use]
pub fn check_file_size(size: usize, content_type: &str) -> Option<String> {
    let limit = match upload_type_for(content_type) {
        "photo" => MAX_PHOTO_SIZE,
        "video" => MAX_VIDEO_SIZE,
        _ => MAX_FILE_SIZE,
    };
    (size > limit).then(|| format!("{content_type} too large: {size} bytes (max {limit})"))
}

/// Build an outbound attachment descriptor around an upload token.
///
/// The Bot API spells photo attachments `image`; the user API spells them
/// `photo`. Files carry their filename next to the payload.
#[must_use]
pub fn attachment_payload(
    token: &str,
    content_type: &str,
    filename: &str,
    bot_api: bool,
) -> Value {
    let upload_type = upload_type_for(content_type);
    let wire_type = match upload_type {
        "photo" if bot_api => "image",
        other => other,
    };
    let mut payload = json!({"type": wire_type, "payload": {"token": token}});
    if upload_type == "file" && !filename.is_empty() {
        payload["filename"] = Value::String(filename.to_string());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_type_classification() {
        assert_eq!(upload_type_for("image/png"), "photo");
        assert_eq!(upload_type_for("video/mp4"), "video");
        assert_eq!(upload_type_for("audio/ogg"), "audio");
        assert_eq!(upload_type_for("application/pdf"), "file");
    }

    #[test]
    fn photo_spelling_differs_by_api() {
        let bot = attachment_payload("T", "image/jpeg", "", true);
        let user = attachment_payload("T", "image/jpeg", "", false);
        assert_eq!(bot["type"], "image");
        assert_eq!(user["type"], "photo");
        assert_eq!(bot["payload"]["token"], "T");
    }

    #[test]
    fn file_payload_carries_filename() {
        let file = attachment_payload("T", "application/pdf", "doc.pdf", true);
        assert_eq!(file["type"], "file");
        assert_eq!(file["filename"], "doc.pdf");
    }

    #[test]
    fn size_limits() {
        assert!(check_file_size(1024, "image/png").is_none());
        assert!(check_file_size(MAX_PHOTO_SIZE + 1, "image/png").is_some());
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime_type("a.png"), "image/png");
        assert_eq!(guess_mime_type("unknown.zzz"), "application/octet-stream");
    }
}
