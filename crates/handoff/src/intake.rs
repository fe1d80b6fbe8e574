//! Hint Intake Handler -- spec.md §4.3.

use handoff_store::HintRepository;
use proto_handoff::{HintedHandoff, HintedHandoffReply, HintedHandoffResult};

/// Accepts a `HintedHandoff` request, persists it, and returns the reply to
/// send back to `request.reply_topic`. The reply is only ever emitted after
/// this function returns, satisfying spec.md §4.3/§5's "reply strictly
/// after durable persistence" ordering -- `store` itself does not return
/// until the write is fsync-durable.
pub fn handle_hinted_handoff(repo: &HintRepository, request: &HintedHandoff) -> HintedHandoffReply {
    tracing::info!(
        avatar_id = request.segment.avatar_id,
        key = %request.segment.key,
        version_number = request.segment.version_number,
        segment_number = request.segment.segment_number,
        dest_peer = %request.dest_peer,
        "intake: hinted handoff received"
    );

    let result = repo.store(
        &request.dest_peer,
        request.timestamp.0,
        request.segment.avatar_id,
        &request.segment.key,
        request.segment.version_number,
        request.segment.segment_number,
        request.payload_ref.clone(),
    );

    match result {
        Ok(hint_id) => {
            tracing::debug!(hint_id, "intake: hint stored");
            HintedHandoffReply {
                request_id: request.request_id,
                result: HintedHandoffResult::Successful,
                error_message: None,
            }
        }
        Err(err @ handoff_store::Error::StorageFull) => {
            tracing::warn!(?err, "intake: repository is full");
            HintedHandoffReply {
                request_id: request.request_id,
                result: HintedHandoffResult::ErrorStorageFull,
                error_message: Some(err.to_string()),
            }
        }
        Err(err) => {
            tracing::error!(?err, "intake: failed to persist hint");
            HintedHandoffReply {
                request_id: request.request_id,
                result: HintedHandoffResult::ErrorException,
                error_message: Some(err.to_string()),
            }
        }
    }
}
