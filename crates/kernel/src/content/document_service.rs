//! Document save and delete flows.
//!
//! The document service is the reconciler's caller: on every save it walks
//! the collection's rich-text fields, runs one reconciliation pass per field,
//! and writes the rewritten content back into the document row. On delete it
//! detaches the document from the media owner index before dropping the row.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::media::reconcile::{self, ImageReference, PendingUpload, ReconcileOutcome};
use crate::media::MediaService;
use crate::models::{Collection, Document, User};
use crate::models::document::NewDocument;
use crate::permissions::{Action, PermissionService, ResourceContext};

use super::registry::CollectionRegistry;

/// Document payload of a save request.
#[derive(Debug, Deserialize)]
pub struct DocumentInput {
    /// Present on update, absent on create.
    pub id: Option<Uuid>,
    pub title: String,
    #[serde(default = "default_status")]
    pub status: i16,
    /// Field name -> value; rich-text values map language code -> markup.
    #[serde(default)]
    pub fields: Value,
}

fn default_status() -> i16 {
    1
}

/// A saved document plus what reconciliation left over.
#[derive(Debug)]
pub struct SaveOutcome {
    pub document: Document,
    /// Removal hints no reconciled reference vouched for: media the client
    /// flagged as removed that really is no longer referenced.
    pub removal_candidates: Vec<Uuid>,
    /// Combined counters across this save's reconciliation passes.
    pub reconciled: ReconcileOutcome,
}

/// Document CRUD with per-field media reconciliation.
#[derive(Clone)]
pub struct DocumentService {
    inner: Arc<DocumentServiceInner>,
}

struct DocumentServiceInner {
    pool: sqlx::PgPool,
    collections: CollectionRegistry,
    media: Arc<MediaService>,
    permissions: PermissionService,
    canonical_language: String,
}

impl DocumentService {
    /// Create a new document service.
    pub fn new(
        pool: sqlx::PgPool,
        collections: CollectionRegistry,
        media: Arc<MediaService>,
        permissions: PermissionService,
        canonical_language: String,
    ) -> Self {
        Self {
            inner: Arc::new(DocumentServiceInner {
                pool,
                collections,
                media,
                permissions,
                canonical_language,
            }),
        }
    }

    /// Save a document, reconciling image references in every rich-text
    /// field.
    ///
    /// `uploads` maps reference keys (as they appear in `src="<key>"`
    /// markup) to the files uploaded with this save; each upload is consumed
    /// by the first field whose markup references it. `removal_hints` lists
    /// media ids the client believes are no longer referenced; ids a
    /// reconciliation pass vouches for are struck, the survivors are
    /// returned.
    pub async fn save(
        &self,
        user: &User,
        collection_name: &str,
        input: DocumentInput,
        mut uploads: BTreeMap<String, PendingUpload>,
        removal_hints: Vec<Uuid>,
    ) -> AppResult<SaveOutcome> {
        let collection = self.writable_collection(user, collection_name).await?;

        let existing = match input.id {
            Some(id) => {
                let document = Document::find_by_id(&self.inner.pool, id)
                    .await?
                    .ok_or(AppError::NotFound)?;
                if document.collection != collection.name {
                    return Err(AppError::Validation(format!(
                        "document {id} does not belong to collection {collection_name}"
                    )));
                }
                Some(document)
            }
            None => None,
        };

        // Usage rows are keyed by the document id, so a create picks its id
        // before any row exists.
        let document_id = existing
            .as_ref()
            .map_or_else(Uuid::now_v7, |document| document.id);

        let mut fields = input.fields;
        if !fields.is_object() {
            if !fields.is_null() {
                return Err(AppError::Validation(
                    "document fields must be an object".to_string(),
                ));
            }
            fields = Value::Object(serde_json::Map::new());
        }

        let mut hints = removal_hints;
        let mut combined = ReconcileOutcome::default();

        for field_name in collection.rich_text_fields() {
            let Some(mut content) = rich_text_value(&fields, &field_name) else {
                continue;
            };

            let references = claim_uploads(&content, &mut uploads);
            let outcome = reconcile::reconcile(
                self.inner.media.as_ref(),
                &mut content,
                references,
                document_id,
                user.id,
                &self.inner.canonical_language,
                hints,
            )
            .await?;

            debug!(
                document_id = %document_id,
                field = %field_name,
                references = outcome.resolved.len(),
                persisted = outcome.persisted,
                "rich-text field reconciled"
            );

            hints = outcome.removal_candidates.clone();
            combined.persisted += outcome.persisted;
            combined.usages_recorded += outcome.usages_recorded;
            combined.skipped += outcome.skipped;
            combined.resolved.extend(outcome.resolved);

            set_rich_text_value(&mut fields, &field_name, content);
        }

        for key in uploads.keys() {
            warn!(
                document_id = %document_id,
                reference = %key,
                "uploaded file referenced by no rich-text field, dropped"
            );
        }

        combined.removal_candidates = hints.clone();

        let document = match existing {
            Some(document) => {
                Document::update(&self.inner.pool, document.id, &input.title, input.status, &fields)
                    .await?
                    .ok_or(AppError::NotFound)?
            }
            None => {
                Document::create(
                    &self.inner.pool,
                    NewDocument {
                        id: document_id,
                        collection: collection.name.clone(),
                        author_id: user.id,
                        title: input.title,
                        status: input.status,
                        fields,
                    },
                )
                .await?
            }
        };

        info!(
            document_id = %document.id,
            collection = %document.collection,
            persisted = combined.persisted,
            "document saved"
        );

        Ok(SaveOutcome {
            document,
            removal_candidates: hints,
            reconciled: combined,
        })
    }

    /// Fetch a document, checking read permission on its collection.
    pub async fn fetch(&self, user: &User, document_id: Uuid) -> AppResult<Document> {
        let document = Document::find_by_id(&self.inner.pool, document_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let collection = self.collection(&document.collection).await?;
        self.require(user, &collection, Action::Read).await?;

        Ok(document)
    }

    /// List a collection's documents, checking read permission.
    pub async fn list(&self, user: &User, collection_name: &str) -> AppResult<Vec<Document>> {
        let collection = self.collection(collection_name).await?;
        self.require(user, &collection, Action::Read).await?;

        Ok(Document::list_for_collection(&self.inner.pool, collection_name).await?)
    }

    /// Delete a document and remove it from every media owner set.
    pub async fn delete(&self, user: &User, document_id: Uuid) -> AppResult<u64> {
        let document = Document::find_by_id(&self.inner.pool, document_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let collection = self.collection(&document.collection).await?;
        self.require(user, &collection, Action::Write).await?;

        let detached =
            reconcile::detach_document(self.inner.media.as_ref(), document_id).await?;

        Document::delete(&self.inner.pool, document_id).await?;

        info!(
            document_id = %document_id,
            collection = %document.collection,
            detached,
            "document deleted"
        );

        Ok(detached)
    }

    async fn writable_collection(
        &self,
        user: &User,
        name: &str,
    ) -> AppResult<Arc<Collection>> {
        let collection = self.collection(name).await?;
        self.require(user, &collection, Action::Write).await?;
        Ok(collection)
    }

    async fn collection(&self, name: &str) -> AppResult<Arc<Collection>> {
        self.inner
            .collections
            .get(name)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn require(
        &self,
        user: &User,
        collection: &Collection,
        action: Action,
    ) -> AppResult<()> {
        let allowed = self
            .inner
            .permissions
            .check(user, &ResourceContext::Collection { collection, action })
            .await?;

        if allowed {
            Ok(())
        } else {
            let verb = match action {
                Action::Read => "read",
                Action::Write => "write",
            };
            Err(AppError::PermissionDenied(format!(
                "not allowed to {verb} collection {}",
                collection.name
            )))
        }
    }
}

impl std::fmt::Debug for DocumentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentService").finish()
    }
}

/// Extract a rich-text field value as a language -> markup map.
///
/// Returns `None` for absent or non-object values; non-string language
/// entries are dropped.
fn rich_text_value(fields: &Value, field_name: &str) -> Option<BTreeMap<String, String>> {
    let map = fields.get(field_name)?.as_object()?;

    Some(
        map.iter()
            .filter_map(|(language, markup)| {
                markup
                    .as_str()
                    .map(|m| (language.clone(), m.to_string()))
            })
            .collect(),
    )
}

/// Write a rewritten language map back into the fields object.
fn set_rich_text_value(fields: &mut Value, field_name: &str, content: BTreeMap<String, String>) {
    let value = Value::Object(
        content
            .into_iter()
            .map(|(language, markup)| (language, Value::String(markup)))
            .collect(),
    );

    if let Some(map) = fields.as_object_mut() {
        map.insert(field_name.to_string(), value);
    }
}

/// Move the uploads this field's markup references out of the shared pool.
///
/// An upload is claimed when its `src="<key>"` token appears in any language
/// variant, so each upload is consumed exactly once even when a document has
/// several rich-text fields.
fn claim_uploads(
    content: &BTreeMap<String, String>,
    pool: &mut BTreeMap<String, PendingUpload>,
) -> BTreeMap<String, ImageReference> {
    let claimed: Vec<String> = pool
        .keys()
        .filter(|key| {
            let token = format!("src=\"{key}\"");
            content.values().any(|markup| markup.contains(&token))
        })
        .cloned()
        .collect();

    claimed
        .into_iter()
        .filter_map(|key| {
            pool.remove(&key)
                .map(|upload| (key, ImageReference::Pending(upload)))
        })
        .collect()
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upload(name: &str) -> PendingUpload {
        PendingUpload {
            filename: format!("{name}.png"),
            content_type: "image/png".to_string(),
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn rich_text_value_extracts_language_map() {
        let fields = json!({
            "body": {"en": "<p>hi</p>", "de": "<p>hallo</p>", "junk": 42},
            "title": "not rich text"
        });

        let content = rich_text_value(&fields, "body").unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content["en"], "<p>hi</p>");

        // A plain string field is not a language map.
        assert!(rich_text_value(&fields, "title").is_none());
        assert!(rich_text_value(&fields, "missing").is_none());
    }

    #[test]
    fn set_rich_text_value_replaces_field() {
        let mut fields = json!({"body": {"en": "old"}});
        let content = BTreeMap::from([("en".to_string(), "new".to_string())]);

        set_rich_text_value(&mut fields, "body", content);
        assert_eq!(fields["body"]["en"], "new");
    }

    #[test]
    fn claim_uploads_takes_only_referenced_keys() {
        let content = BTreeMap::from([
            ("en".to_string(), r#"<img src="tmp1"> text"#.to_string()),
            ("de".to_string(), r#"<img src="tmp2"> text"#.to_string()),
        ]);
        let mut pool = BTreeMap::from([
            ("tmp1".to_string(), upload("a")),
            ("tmp2".to_string(), upload("b")),
            ("tmp3".to_string(), upload("c")),
        ]);

        let claimed = claim_uploads(&content, &mut pool);

        assert_eq!(claimed.len(), 2);
        assert!(claimed.contains_key("tmp1"));
        assert!(claimed.contains_key("tmp2"));
        // tmp3 stays in the pool for another field (or a warning).
        assert_eq!(pool.len(), 1);
        assert!(pool.contains_key("tmp3"));
    }

    #[test]
    fn claim_uploads_is_consumed_once() {
        let content = BTreeMap::from([("en".to_string(), r#"<img src="tmp1">"#.to_string())]);
        let mut pool = BTreeMap::from([("tmp1".to_string(), upload("a"))]);

        assert_eq!(claim_uploads(&content, &mut pool).len(), 1);
        // A second field with the same markup finds the pool empty.
        assert!(claim_uploads(&content, &mut pool).is_empty());
    }
}
