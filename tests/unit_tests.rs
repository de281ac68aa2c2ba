//! Cross-module checks over the crate's public surface.

use persona_worker::memory::retrieval::split_budget;
use persona_worker::request::{Attachment, MediaKind, ResponseDestination};
use persona_worker::util::retry::RetryConfig;
use persona_worker::util::text::{
    normalize_for_similarity, sanitize_json, strip_response_footer,
};
use rstest::rstest;

fn attachment(content_type: &str, voice: bool) -> Attachment {
    Attachment {
        url: "https://ex/file".to_string(),
        original_url: None,
        content_type: content_type.to_string(),
        name: None,
        size: None,
        is_voice_message: if voice { Some(true) } else { None },
        duration_seconds: None,
    }
}

#[rstest]
#[case("image/png", false, Some(MediaKind::Image))]
#[case("image/webp", false, Some(MediaKind::Image))]
#[case("audio/ogg", false, Some(MediaKind::Audio))]
#[case("application/octet-stream", true, Some(MediaKind::Audio))]
#[case("application/pdf", false, None)]
#[case("text/plain", false, None)]
fn attachments_route_by_content_type_prefix(
    #[case] content_type: &str,
    #[case] voice: bool,
    #[case] expected: Option<MediaKind>,
) {
    assert_eq!(attachment(content_type, voice).media_kind(), expected);
}

#[test]
fn channel_budget_is_never_zero_for_positive_ratio() {
    // A limit of 1 with half the budget on the channel still allocates the
    // channel its slot.
    assert_eq!(split_budget(1, 0.5), (1, 0));

    for limit in 1..=20 {
        let (channel, global) = split_budget(limit, 0.5);
        assert!(channel >= 1);
        assert_eq!(channel + global, limit);
    }
}

#[test]
fn footer_stripping_is_idempotent() {
    let body = "An answer.\n-# model: x | 9ms";
    let once = strip_response_footer(body);
    assert_eq!(strip_response_footer(&once), once);
}

#[test]
fn normalization_is_case_and_spacing_insensitive() {
    assert_eq!(
        normalize_for_similarity("Hello  World"),
        normalize_for_similarity("hello world")
    );
}

#[test]
fn sanitized_json_is_free_of_nul_bytes() {
    let dirty = serde_json::json!({
        "prompt": "before\u{0}after",
        "nested": [{"deep": "x\u{0}"}]
    });

    let clean = sanitize_json(dirty);
    let rendered = serde_json::to_string(&clean).expect("serialize");
    assert!(!rendered.contains("\\u0000"));
}

#[test]
fn retry_budget_counts_the_first_attempt() {
    let retry = RetryConfig::new(3, 100, 1000);
    let allowed: Vec<usize> = (0..5).filter(|a| retry.can_retry(*a)).collect();
    assert_eq!(allowed, vec![0, 1, 2]);
}

#[test]
fn delivery_channels_are_scoped_by_destination_kind() {
    let discord = ResponseDestination {
        kind: "discord".to_string(),
        channel_id: "c1".to_string(),
    };
    let matrix = ResponseDestination {
        kind: "matrix".to_string(),
        channel_id: "c1".to_string(),
    };
    assert_ne!(discord.delivery_channel(), matrix.delivery_channel());
}
