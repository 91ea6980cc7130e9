use super::print_json;
use relay_core::{Gateway, LoopEvent, LoopOutcome};
use relay_provider::{Attachment, ChatRequest, Message, SamplingOptions};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Build a single-turn request, attaching any images.
pub fn build_request(
    model: &str,
    prompt: &str,
    system: Option<String>,
    images: &[PathBuf],
    options: SamplingOptions,
) -> anyhow::Result<ChatRequest> {
    let mut message = Message::user(prompt);
    for path in images {
        let mime_type = image_mime_type(path)
            .ok_or_else(|| anyhow::anyhow!("Unsupported image type: {}", path.display()))?;
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let mut attachment = Attachment::from_bytes(mime_type, &bytes);
        if let Some(name) = path.file_name() {
            attachment = attachment.with_name(name.to_string_lossy());
        }
        message = message.with_attachment(attachment);
    }

    Ok(ChatRequest {
        model: model.to_string(),
        system,
        messages: vec![message],
        tools: Vec::new(),
        options,
    })
}

fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Run one chat, streaming loop events to stdout. Ctrl-C cancels.
pub async fn run(gateway: &Gateway, provider: &str, request: ChatRequest) -> anyhow::Result<()> {
    let stream = gateway.open_stream();
    let stream_id = stream.id().clone();
    print_json(&json!({"type": "stream", "stream_id": stream_id}))?;

    let mut write_error = None;
    let outcome = {
        let mut sink = |event: LoopEvent| {
            if let Err(err) = print_json(&event) {
                write_error.get_or_insert(err);
            }
        };
        let chat = gateway.run_chat(stream, provider, request, &mut sink);
        tokio::pin!(chat);
        let outcome = tokio::select! {
            outcome = &mut chat => outcome,
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!(stream = %stream_id, "interrupt received");
                gateway.cancel(stream_id.as_str());
                chat.await
            }
        };
        outcome
    };

    if let Some(err) = write_error {
        return Err(err);
    }
    match outcome? {
        LoopOutcome::Completed(_) => Ok(()),
        LoopOutcome::Cancelled => print_json(&json!({"type": "cancelled", "stream_id": stream_id})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_image_mime_types() {
        assert_eq!(image_mime_type(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(image_mime_type(Path::new("b.jpeg")), Some("image/jpeg"));
        assert_eq!(image_mime_type(Path::new("c.txt")), None);
        assert_eq!(image_mime_type(Path::new("noext")), None);
    }

    #[test]
    fn test_build_request_attaches_images() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pixel.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let request = build_request(
            "llava",
            "what is this?",
            Some("be brief".to_string()),
            &[path],
            SamplingOptions::default(),
        )
        .unwrap();
        let attachment = &request.messages[0].attachments[0];
        assert_eq!(request.model, "llava");
        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.name.as_deref(), Some("pixel.png"));
        assert_eq!(attachment.data, "iVBORw==");

        let missing = build_request("m", "x", None, &[dir.path().join("gone.png")], SamplingOptions::default());
        assert!(missing.is_err());
    }
}
