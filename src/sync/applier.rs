//! Applies cleared operations to the store and stamps provenance.
//!
//! Provenance fields always win over client fields with the same name.
//! Deletes are soft: the document stays in the store with `isActive: false`.

use serde_json::Value;
use std::sync::Arc;

use super::error::OperationError;
use super::operation::{Operation, OperationType};
use crate::clock::{format_timestamp, Clock};
use crate::identity::AuthUser;
use crate::store::{merge_into, Document, EntityStore};

/// Performs store mutations on behalf of a caller.
#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
}

impl Applier {
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Applies `op` and returns the id of the document it touched.
    pub async fn apply(&self, actor: &AuthUser, op: &Operation) -> Result<String, OperationError> {
        let target = || {
            op.document_id
                .as_deref()
                .ok_or_else(|| OperationError::not_found(&op.collection, ""))
        };

        match op.kind {
            OperationType::Create => self.create(actor, &op.collection, op.data.clone()).await,
            OperationType::Update => {
                let id = target()?;
                self.update(actor, &op.collection, id, op.data.clone())
                    .await?;
                Ok(id.to_string())
            }
            OperationType::Delete => {
                let id = target()?;
                self.soft_delete(actor, &op.collection, id).await?;
                Ok(id.to_string())
            }
        }
    }

    /// Creates a document under a freshly minted id.
    pub async fn create(
        &self,
        actor: &AuthUser,
        collection: &str,
        data: Document,
    ) -> Result<String, OperationError> {
        let now = Value::String(format_timestamp(self.clock.now()));

        let mut document = data;
        merge_into(
            &mut document,
            provenance([
                ("createdBy", Value::String(actor.user_id.clone())),
                ("createdAt", now.clone()),
                ("updatedAt", now.clone()),
                ("lastSyncedAt", now),
            ]),
        );

        Ok(self.store.create(collection, document).await?)
    }

    /// Merges `data` over an existing document.
    pub async fn update(
        &self,
        actor: &AuthUser,
        collection: &str,
        id: &str,
        data: Document,
    ) -> Result<(), OperationError> {
        let now = Value::String(format_timestamp(self.clock.now()));

        let mut patch = data;
        merge_into(
            &mut patch,
            provenance([
                ("updatedBy", Value::String(actor.user_id.clone())),
                ("updatedAt", now.clone()),
                ("lastSyncedAt", now),
            ]),
        );

        Ok(self.store.update(collection, id, patch).await?)
    }

    /// Marks a document inactive.
    pub async fn soft_delete(
        &self,
        actor: &AuthUser,
        collection: &str,
        id: &str,
    ) -> Result<(), OperationError> {
        let now = Value::String(format_timestamp(self.clock.now()));

        let patch = provenance([
            ("isActive", Value::Bool(false)),
            ("deletedBy", Value::String(actor.user_id.clone())),
            ("deletedAt", now.clone()),
            ("updatedAt", now.clone()),
            ("lastSyncedAt", now),
        ]);

        Ok(self.store.update(collection, id, patch).await?)
    }
}

fn provenance<const N: usize>(fields: [(&str, Value); N]) -> Document {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
