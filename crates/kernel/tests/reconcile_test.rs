#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Media reference reconciliation tests.
//!
//! Runs the reconciler against an in-memory persistence fake, so every
//! property of the save and delete flows is checked without a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use uuid::Uuid;

use intarsio_kernel::media::reconcile::{self, ReconcileError};
use intarsio_kernel::media::{ImageReference, MediaPersistence, PendingUpload, SavedMedia};

/// In-memory media persistence: saved uploads plus an owner index.
#[derive(Default)]
struct FakePersistence {
    state: Mutex<FakeState>,
    /// When set, every persistence call fails.
    broken: bool,
}

#[derive(Default)]
struct FakeState {
    /// Ids of media records that exist.
    media: BTreeSet<Uuid>,
    /// (media_id, document_id) owner links.
    usages: BTreeSet<(Uuid, Uuid)>,
    /// Filenames in save order.
    saved: Vec<String>,
    /// Total add_usage calls, including idempotent repeats.
    usage_calls: usize,
}

impl FakePersistence {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    /// Pre-register an existing media record, as the library picker would
    /// reference it.
    fn with_media(self, ids: &[Uuid]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.media.extend(ids.iter().copied());
        }
        self
    }

    fn owners_of(&self, media_id: Uuid) -> Vec<Uuid> {
        self.state
            .lock()
            .unwrap()
            .usages
            .iter()
            .filter(|(m, _)| *m == media_id)
            .map(|(_, d)| *d)
            .collect()
    }

    fn usage_count(&self) -> usize {
        self.state.lock().unwrap().usages.len()
    }
}

#[async_trait]
impl MediaPersistence for FakePersistence {
    async fn save(&self, upload: PendingUpload, _owner: Uuid) -> Result<SavedMedia> {
        if self.broken {
            return Err(anyhow!("storage backend unreachable"));
        }

        let id = Uuid::now_v7();
        let url = format!("/files/{id}_{}", upload.filename);

        let mut state = self.state.lock().unwrap();
        state.media.insert(id);
        state.saved.push(upload.filename);

        Ok(SavedMedia { id, url })
    }

    async fn add_usage(&self, media_id: Uuid, document_id: Uuid) -> Result<bool> {
        if self.broken {
            return Err(anyhow!("database unreachable"));
        }

        let mut state = self.state.lock().unwrap();
        state.usage_calls += 1;
        if !state.media.contains(&media_id) {
            return Ok(false);
        }
        state.usages.insert((media_id, document_id));
        Ok(true)
    }

    async fn detach_owner(&self, document_id: Uuid) -> Result<u64> {
        if self.broken {
            return Err(anyhow!("database unreachable"));
        }

        let mut state = self.state.lock().unwrap();
        let before = state.usages.len();
        state.usages.retain(|(_, d)| *d != document_id);
        Ok((before - state.usages.len()) as u64)
    }
}

fn upload(name: &str) -> PendingUpload {
    PendingUpload {
        filename: name.to_string(),
        content_type: "image/png".to_string(),
        data: vec![0xFF; 16],
    }
}

fn content(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(lang, markup)| ((*lang).to_string(), (*markup).to_string()))
        .collect()
}

#[tokio::test]
async fn embedded_markers_are_recorded_as_usages() {
    let id_a = Uuid::now_v7();
    let id_b = Uuid::now_v7();
    let fake = FakePersistence::default().with_media(&[id_a, id_b]);
    let document_id = Uuid::now_v7();

    let markup = format!(
        r#"<p>one</p><img src="/files/a.png" media_image="{id_a}"><img src="/files/b.png" media_image="{id_b}">"#
    );
    let mut body = content(&[("en", &markup)]);

    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        BTreeMap::new(),
        document_id,
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap();

    assert_eq!(outcome.resolved.len(), 2);
    assert_eq!(outcome.usages_recorded, 2);
    assert_eq!(outcome.persisted, 0);
    assert_eq!(fake.owners_of(id_a), vec![document_id]);
    assert_eq!(fake.owners_of(id_b), vec![document_id]);
    // Markup with no pending uploads is left untouched.
    assert_eq!(body["en"], markup);
}

#[tokio::test]
async fn repeated_save_is_idempotent() {
    let id = Uuid::now_v7();
    let fake = FakePersistence::default().with_media(&[id]);
    let document_id = Uuid::now_v7();
    let markup = format!(r#"<img src="/files/a.png" media_image="{id}">"#);

    for _ in 0..3 {
        let mut body = content(&[("en", &markup)]);
        reconcile::reconcile(
            &fake,
            &mut body,
            BTreeMap::new(),
            document_id,
            Uuid::now_v7(),
            "en",
            vec![],
        )
        .await
        .unwrap();
    }

    // Three passes, one owner link.
    assert_eq!(fake.usage_count(), 1);
    assert_eq!(fake.owners_of(id), vec![document_id]);
    assert_eq!(fake.state.lock().unwrap().usage_calls, 3);
}

#[tokio::test]
async fn pending_upload_is_persisted_and_rewritten_in_every_language() {
    let fake = FakePersistence::default();
    let document_id = Uuid::now_v7();

    let mut body = content(&[
        ("en", r#"<p>hello</p><img src="tmp1" alt="cat">"#),
        ("de", r#"<p>hallo</p><img src="tmp1" alt="Katze">"#),
    ]);
    let references = BTreeMap::from([("tmp1".to_string(), ImageReference::Pending(upload("cat.png")))]);

    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        references,
        document_id,
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap();

    assert_eq!(outcome.persisted, 1);
    assert_eq!(outcome.resolved.len(), 1);
    let media_id = outcome.resolved[0];

    for markup in body.values() {
        assert!(!markup.contains(r#"src="tmp1""#), "token left in {markup}");
        assert!(markup.contains(&format!("media_image=\"{media_id}\"")));
        assert!(markup.contains("/files/"));
    }
    assert_eq!(fake.owners_of(media_id), vec![document_id]);
}

#[tokio::test]
async fn uploads_are_persisted_in_reference_order() {
    let fake = FakePersistence::default();

    let mut body = content(&[("en", r#"<img src="tmp1"><img src="tmp2"><img src="tmp3">"#)]);
    let references = BTreeMap::from([
        ("tmp1".to_string(), ImageReference::Pending(upload("first.png"))),
        ("tmp2".to_string(), ImageReference::Pending(upload("second.png"))),
        ("tmp3".to_string(), ImageReference::Pending(upload("third.png"))),
    ]);

    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        references,
        Uuid::now_v7(),
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap();

    assert_eq!(outcome.persisted, 3);
    assert_eq!(
        fake.state.lock().unwrap().saved,
        vec!["first.png", "second.png", "third.png"]
    );
}

#[tokio::test]
async fn resolved_reference_strikes_every_matching_removal_hint() {
    let kept = Uuid::now_v7();
    let gone = Uuid::now_v7();
    let fake = FakePersistence::default().with_media(&[kept]);

    let markup = format!(r#"<img src="/files/k.png" media_image="{kept}">"#);
    let mut body = content(&[("en", &markup)]);

    // The client listed the still-referenced id twice; both occurrences must
    // be struck, while the genuinely removed id survives.
    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        BTreeMap::new(),
        Uuid::now_v7(),
        Uuid::now_v7(),
        "en",
        vec![kept, gone, kept],
    )
    .await
    .unwrap();

    assert_eq!(outcome.removal_candidates, vec![gone]);
}

#[tokio::test]
async fn unknown_media_id_is_skipped_not_fatal() {
    let fake = FakePersistence::default();
    let ghost = Uuid::now_v7();

    let markup = format!(r#"<img src="/files/g.png" media_image="{ghost}">"#);
    let mut body = content(&[("en", &markup)]);

    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        BTreeMap::new(),
        Uuid::now_v7(),
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap();

    // The reference resolved but no record backed it.
    assert_eq!(outcome.resolved, vec![ghost]);
    assert_eq!(outcome.usages_recorded, 0);
    assert_eq!(outcome.skipped, 1);
}

#[tokio::test]
async fn malformed_marker_is_skipped() {
    let fake = FakePersistence::default();
    let mut body = content(&[("en", r#"<img media_image="not-a-media-id">"#)]);

    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        BTreeMap::new(),
        Uuid::now_v7(),
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap();

    assert!(outcome.resolved.is_empty());
    assert_eq!(outcome.skipped, 1);
}

#[tokio::test]
async fn non_canonical_markers_are_not_scanned() {
    let id = Uuid::now_v7();
    let fake = FakePersistence::default().with_media(&[id]);

    // The marker appears only in the German variant; the canonical English
    // scan must not pick it up.
    let markup = format!(r#"<img src="/files/d.png" media_image="{id}">"#);
    let mut body = content(&[("en", "<p>no images</p>"), ("de", &markup)]);

    let outcome = reconcile::reconcile(
        &fake,
        &mut body,
        BTreeMap::new(),
        Uuid::now_v7(),
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap();

    assert!(outcome.resolved.is_empty());
    assert_eq!(fake.usage_count(), 0);
}

#[tokio::test]
async fn failing_collaborator_aborts_without_owner_writes() {
    let fake = FakePersistence::broken();

    let mut body = content(&[("en", r#"<img src="tmp1">"#)]);
    let references = BTreeMap::from([("tmp1".to_string(), ImageReference::Pending(upload("x.png")))]);

    let err = reconcile::reconcile(
        &fake,
        &mut body,
        references,
        Uuid::now_v7(),
        Uuid::now_v7(),
        "en",
        vec![],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ReconcileError::DependencyUnavailable(_)));
    // Nothing was recorded and the markup keeps its token.
    assert_eq!(fake.usage_count(), 0);
    assert!(body["en"].contains(r#"src="tmp1""#));
}

#[tokio::test]
async fn detach_removes_document_everywhere_and_nowhere_else() {
    let media_a = Uuid::now_v7();
    let media_b = Uuid::now_v7();
    let fake = FakePersistence::default().with_media(&[media_a, media_b]);

    let doc_one = Uuid::now_v7();
    let doc_two = Uuid::now_v7();

    // doc_one references both images, doc_two references one.
    for (media, doc) in [(media_a, doc_one), (media_b, doc_one), (media_a, doc_two)] {
        assert!(fake.add_usage(media, doc).await.unwrap());
    }

    let detached = reconcile::detach_document(&fake, doc_one).await.unwrap();

    assert_eq!(detached, 2);
    assert!(fake.owners_of(media_b).is_empty());
    // doc_two's link survives.
    assert_eq!(fake.owners_of(media_a), vec![doc_two]);
}

#[tokio::test]
async fn detach_of_unknown_document_is_a_noop() {
    let media = Uuid::now_v7();
    let fake = FakePersistence::default().with_media(&[media]);
    let doc = Uuid::now_v7();
    assert!(fake.add_usage(media, doc).await.unwrap());

    let detached = reconcile::detach_document(&fake, Uuid::now_v7()).await.unwrap();

    assert_eq!(detached, 0);
    assert_eq!(fake.owners_of(media), vec![doc]);
}
