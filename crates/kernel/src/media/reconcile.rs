//! Media reference reconciliation for rich-text content.
//!
//! A rich-text field carries one markup string per content language, with
//! images embedded as `<img src="..." media_image="...">` markers. A save
//! arrives with a map of image references: freshly selected files that still
//! need persisting, plus ids of images picked from the media library.
//! Reconciliation persists the new files, rewrites their reference tokens to
//! the stored URL, and records every referenced image in the owner index so
//! images nothing references can be found later.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppError;

/// Matches an embedded image marker and captures the media id it carries.
/// Dot-matches-newline so attribute values split across lines still match.
///
/// # Panics
///
/// Panics if the hard-coded regex literal is invalid (impossible in practice).
#[allow(clippy::expect_used)]
static MEDIA_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)media_image="(.+?)""#).expect("valid regex literal"));

/// A freshly selected file that has not been persisted yet.
///
/// Consumed exactly once, by the reconciliation pass that persists it.
#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A persisted upload: the final media id plus the URL markup points at.
#[derive(Debug, Clone)]
pub struct SavedMedia {
    pub id: Uuid,
    pub url: String,
}

/// One image reference attached to a document save.
#[derive(Debug)]
pub enum ImageReference {
    /// File uploaded with this save; persisted during reconciliation.
    Pending(PendingUpload),
    /// Image picked from the media library, already persisted.
    Persisted(Uuid),
}

/// Persistence operations the reconciler drives.
///
/// Implemented by the media service; tests substitute an in-memory fake.
#[async_trait]
pub trait MediaPersistence: Send + Sync {
    /// Persist a pending upload on behalf of a user, returning the final
    /// media id and public URL.
    async fn save(&self, upload: PendingUpload, owner: Uuid) -> Result<SavedMedia>;

    /// Add a document to an image's owner set. Idempotent. Returns false
    /// when no image with this id exists.
    async fn add_usage(&self, media_id: Uuid, document_id: Uuid) -> Result<bool>;

    /// Remove a document from every image's owner set, returning the number
    /// of owner links removed.
    async fn detach_owner(&self, document_id: Uuid) -> Result<u64>;
}

/// Reconciliation failure.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The persistence collaborator failed. The pass aborts where it stood;
    /// writes made for earlier references are not rolled back.
    #[error("media persistence unavailable")]
    DependencyUnavailable(#[source] anyhow::Error),
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::DependencyUnavailable(source) => {
                AppError::DependencyUnavailable(source)
            }
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Final media ids of every resolved reference, in reference order.
    pub resolved: Vec<Uuid>,
    /// How many pending uploads were persisted.
    pub persisted: usize,
    /// How many owner-set insertions were recorded.
    pub usages_recorded: usize,
    /// Reference tokens that could not be resolved or substituted.
    pub skipped: usize,
    /// Removal hints that survived the pass: ids the client flagged as
    /// removed which no resolved reference vouched for.
    pub removal_candidates: Vec<Uuid>,
}

/// Reconcile a document's image references on save.
///
/// `content` maps language codes to markup and is rewritten in place. The
/// markup of `canonical_language` is scanned first; every embedded
/// `media_image` marker counts as a reference even when absent from
/// `references`. Pending uploads are then persisted one at a time and their
/// `src="<key>"` tokens rewritten to the stored URL in every language
/// variant. Every resolved reference adds `document_id` to the image's owner
/// set and strikes its id from the removal hints, all occurrences.
///
/// Substitution is plain string replacement: reference keys are expected to
/// be unique, non-overlapping substrings of the markup. A token that never
/// matches is logged and counted, not an error.
///
/// Persistence calls are awaited sequentially inside the caller's future,
/// so dropping that future cancels the in-flight call.
pub async fn reconcile(
    persistence: &dyn MediaPersistence,
    content: &mut BTreeMap<String, String>,
    references: BTreeMap<String, ImageReference>,
    document_id: Uuid,
    owner: Uuid,
    canonical_language: &str,
    removal_hints: Vec<Uuid>,
) -> Result<ReconcileOutcome, ReconcileError> {
    let mut references = references;
    let mut outcome = ReconcileOutcome {
        removal_candidates: removal_hints,
        ..ReconcileOutcome::default()
    };

    // Markup can embed images the client never listed, e.g. content pasted
    // in from another document. Fold every marker in the canonical language
    // into the reference map.
    if let Some(markup) = content.get(canonical_language) {
        for capture in MEDIA_IMAGE_RE.captures_iter(markup) {
            let raw = &capture[1];
            match raw.parse::<Uuid>() {
                Ok(id) => {
                    references
                        .entry(raw.to_string())
                        .or_insert(ImageReference::Persisted(id));
                }
                Err(_) => {
                    warn!(token = %raw, "embedded media marker is not a valid media id, skipping");
                    outcome.skipped += 1;
                }
            }
        }
    } else {
        debug!(
            language = %canonical_language,
            "content has no canonical language variant, nothing to scan"
        );
    }

    for (key, reference) in references {
        let resolved = match reference {
            ImageReference::Pending(upload) => {
                let saved = persistence
                    .save(upload, owner)
                    .await
                    .map_err(ReconcileError::DependencyUnavailable)?;
                outcome.persisted += 1;

                if substitute(content, &key, &saved) {
                    debug!(reference = %key, media_id = %saved.id, "reference token rewritten");
                } else {
                    warn!(
                        reference = %key,
                        media_id = %saved.id,
                        "reference token not found in any language variant"
                    );
                    outcome.skipped += 1;
                }

                saved.id
            }
            ImageReference::Persisted(id) => id,
        };

        // Whatever the client claims was removed, a reference resolved in
        // this pass is still in use. Strike all occurrences of its id.
        outcome.removal_candidates.retain(|hint| *hint != resolved);

        let recorded = persistence
            .add_usage(resolved, document_id)
            .await
            .map_err(ReconcileError::DependencyUnavailable)?;
        if recorded {
            outcome.usages_recorded += 1;
        } else {
            warn!(media_id = %resolved, "referenced media record does not exist");
            outcome.skipped += 1;
        }

        outcome.resolved.push(resolved);
    }

    Ok(outcome)
}

/// Remove a deleted document from every image's owner set.
///
/// Deliberately a pass over the whole owner index rather than a lookup of
/// the ids the document's markup mentions: markup is not rescanned on
/// delete, so the index itself is the authority on what the document owned.
pub async fn detach_document(
    persistence: &dyn MediaPersistence,
    document_id: Uuid,
) -> Result<u64, ReconcileError> {
    let detached = persistence
        .detach_owner(document_id)
        .await
        .map_err(ReconcileError::DependencyUnavailable)?;

    debug!(document_id = %document_id, detached, "document detached from media owner index");
    Ok(detached)
}

/// Rewrite one pending reference token to its stored URL in every language
/// variant. Returns whether any variant contained the token.
fn substitute(content: &mut BTreeMap<String, String>, key: &str, saved: &SavedMedia) -> bool {
    let token = format!("src=\"{key}\"");
    let replacement = format!("src=\"{}\" media_image=\"{}\"", saved.url, saved.id);

    let mut matched = false;
    for markup in content.values_mut() {
        if markup.contains(&token) {
            *markup = markup.replace(&token, &replacement);
            matched = true;
        }
    }

    matched
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn marker_pattern_captures_each_id() {
        let markup = concat!(
            r#"<p>intro</p>"#,
            r#"<img src="/files/a.png" media_image="0192d3e8-0000-7000-8000-000000000001">"#,
            r#"<p>middle</p>"#,
            r#"<img src="/files/b.png" media_image="0192d3e8-0000-7000-8000-000000000002">"#,
        );

        let ids: Vec<&str> = MEDIA_IMAGE_RE
            .captures_iter(markup)
            .map(|c| c.get(1).unwrap().as_str())
            .collect();

        assert_eq!(
            ids,
            vec![
                "0192d3e8-0000-7000-8000-000000000001",
                "0192d3e8-0000-7000-8000-000000000002",
            ]
        );
    }

    #[test]
    fn marker_pattern_spans_newlines() {
        let markup = "before <img\nmedia_image=\"abc\n123\"> after";
        let capture = MEDIA_IMAGE_RE.captures(markup).unwrap();
        assert_eq!(&capture[1], "abc\n123");
    }

    #[test]
    fn marker_pattern_is_lazy() {
        // Two markers on one line must not merge into one greedy match.
        let markup = r#"<img media_image="one"> <img media_image="two">"#;
        let ids: Vec<&str> = MEDIA_IMAGE_RE
            .captures_iter(markup)
            .map(|c| c.get(1).unwrap().as_str())
            .collect();
        assert_eq!(ids, vec!["one", "two"]);
    }

    #[test]
    fn substitute_rewrites_every_language() {
        let mut content = BTreeMap::from([
            ("en".to_string(), r#"<p>hi</p><img src="tmp1">"#.to_string()),
            ("de".to_string(), r#"<p>hallo</p><img src="tmp1">"#.to_string()),
        ]);
        let saved = SavedMedia {
            id: Uuid::parse_str("0192d3e8-0000-7000-8000-0000000000aa").unwrap(),
            url: "/files/2026/08/abcd1234_photo.png".to_string(),
        };

        assert!(substitute(&mut content, "tmp1", &saved));

        for markup in content.values() {
            assert!(markup.contains(
                r#"src="/files/2026/08/abcd1234_photo.png" media_image="0192d3e8-0000-7000-8000-0000000000aa""#
            ));
            assert!(!markup.contains("tmp1"));
        }
    }

    #[test]
    fn substitute_reports_missing_token() {
        let mut content = BTreeMap::from([("en".to_string(), "<p>no images</p>".to_string())]);
        let saved = SavedMedia {
            id: Uuid::now_v7(),
            url: "/files/x.png".to_string(),
        };

        assert!(!substitute(&mut content, "tmp1", &saved));
        assert_eq!(content["en"], "<p>no images</p>");
    }

    #[test]
    fn substitute_leaves_other_tokens_alone() {
        let mut content = BTreeMap::from([(
            "en".to_string(),
            r#"<img src="tmp1"> <img src="tmp2">"#.to_string(),
        )]);
        let saved = SavedMedia {
            id: Uuid::now_v7(),
            url: "/files/one.png".to_string(),
        };

        substitute(&mut content, "tmp1", &saved);

        assert!(content["en"].contains(r#"src="tmp2""#));
        assert!(content["en"].contains("/files/one.png"));
    }
}
