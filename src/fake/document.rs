//! Schema-less document collections with operator queries and per-collection TTL.

use super::filter::{lookup, matches, sort_order};
use super::{Expire, IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs, duration_ms};
use crate::helpers::validate_resource_name;
use crate::testing::Resettable;
use crate::traits::{
    CloudError, CloudResult, CollectionConfig, CollectionInfo, Document, DocumentIO, DocumentQuery,
    Filter, ResourceId,
};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug)]
struct Collection {
    config: CollectionConfig,
    created_at: TimestampMs,
    documents: BTreeMap<String, Document>,
}

impl Collection {
    fn info(&self, name: &str) -> CollectionInfo {
        CollectionInfo {
            name: name.to_string(),
            ttl: self.config.ttl,
            indexes: self.config.indexes.clone(),
            document_count: self.documents.len() as u64,
            created_at: self.created_at,
        }
    }

    fn matching<'a>(&'a self, filter: &'a Filter) -> impl Iterator<Item = &'a Document> + 'a {
        self.documents
            .values()
            .filter(move |doc| matches(filter, &doc.data, &self.config.indexes))
    }
}

#[derive(Debug, Default)]
pub struct DocumentState {
    collections: BTreeMap<String, Collection>,
    ids: IdSequence,
}

impl DocumentState {
    fn collection_mut(&mut self, name: &str) -> CloudResult<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(collection_id(name)))
    }
}

impl Expire for DocumentState {
    fn expire(&mut self, now: TimestampMs) {
        for (name, collection) in &mut self.collections {
            let Some(ttl) = collection.config.ttl else {
                continue;
            };
            let ttl = duration_ms(ttl);
            let before = collection.documents.len();
            collection.documents.retain(|_, doc| doc.updated_at + ttl > now);
            if collection.documents.len() < before {
                debug!(collection = %name, evicted = before - collection.documents.len(), "ttl eviction");
            }
        }
    }
}

fn collection_id(name: &str) -> ResourceId {
    ResourceId::new("collection", name)
}

fn document_id(collection: &str, id: &str) -> ResourceId {
    ResourceId::new("document", id).within(collection)
}

// ============================================================================
// FakeDocumentIO
// ============================================================================

#[derive(Clone)]
pub struct FakeDocumentIO {
    store: Store<DocumentState>,
    env: SimEnv,
}

impl FakeDocumentIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<DocumentState>, env: SimEnv) -> Self {
        store.register_sweeper(&env);
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<DocumentState> {
        self.store.clone()
    }
}

impl Default for FakeDocumentIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeDocumentIO {
    fn reset(&self) {
        *self.store.lock() = DocumentState::default();
    }
}

impl DocumentIO for FakeDocumentIO {
    fn create_collection(
        &self,
        name: &str,
        config: CollectionConfig,
    ) -> CloudResult<CollectionInfo> {
        validate_resource_name(name)?;
        if config.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(CloudError::validation("collection TTL must be positive"));
        }
        let now = self.env.enter("document.create_collection")?;
        let mut state = self.store.lock_at(now);
        if state.collections.contains_key(name) {
            return Err(CloudError::already_exists(collection_id(name)));
        }
        let collection = Collection {
            config,
            created_at: now,
            documents: BTreeMap::new(),
        };
        let info = collection.info(name);
        state.collections.insert(name.to_string(), collection);
        info!(collection = name, ttl = ?info.ttl, "collection created");
        Ok(info)
    }

    fn get_collection(&self, name: &str) -> CloudResult<CollectionInfo> {
        let now = self.env.enter("document.get_collection")?;
        let mut state = self.store.lock_at(now);
        Ok(state.collection_mut(name)?.info(name))
    }

    fn delete_collection(&self, name: &str) -> CloudResult<()> {
        let now = self.env.enter("document.delete_collection")?;
        let mut state = self.store.lock_at(now);
        state
            .collections
            .remove(name)
            .ok_or_else(|| CloudError::not_found(collection_id(name)))?;
        info!(collection = name, "collection deleted");
        Ok(())
    }

    fn list_collections(&self) -> CloudResult<Vec<String>> {
        let now = self.env.enter("document.list_collections")?;
        Ok(self.store.lock_at(now).collections.keys().cloned().collect())
    }

    fn insert(&self, collection: &str, document: Value) -> CloudResult<Document> {
        let Value::Object(mut data) = document else {
            return Err(CloudError::validation("documents must be JSON objects"));
        };
        let explicit_id = match data.get("id") {
            None => None,
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(_) => {
                return Err(CloudError::validation(
                    "document id must be a non-empty string",
                ));
            }
        };

        let now = self.env.enter("document.insert")?;
        let mut state = self.store.lock_at(now);
        let DocumentState { collections, ids } = &mut *state;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| CloudError::not_found(collection_id(collection)))?;

        let id = match explicit_id {
            Some(id) => id,
            None => {
                let id = ids.next("doc");
                data.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        if target.documents.contains_key(&id) {
            return Err(CloudError::already_exists(document_id(collection, &id)));
        }

        let document = Document {
            id: id.clone(),
            data: Value::Object(data),
            created_at: now,
            updated_at: now,
        };
        target.documents.insert(id.clone(), document.clone());
        debug!(collection, id = %id, "document inserted");
        Ok(document)
    }

    fn find_by_id(&self, collection: &str, id: &str) -> CloudResult<Option<Document>> {
        let now = self.env.enter("document.find_by_id")?;
        let mut state = self.store.lock_at(now);
        Ok(state.collection_mut(collection)?.documents.get(id).cloned())
    }

    fn update(&self, collection: &str, id: &str, patch: Value) -> CloudResult<Document> {
        let Value::Object(patch) = patch else {
            return Err(CloudError::validation("update patch must be a JSON object"));
        };
        if patch.get("id").is_some_and(|new_id| new_id.as_str() != Some(id)) {
            return Err(CloudError::validation("document id cannot be changed"));
        }

        let now = self.env.enter("document.update")?;
        let mut state = self.store.lock_at(now);
        let document = state
            .collection_mut(collection)?
            .documents
            .get_mut(id)
            .ok_or_else(|| CloudError::not_found(document_id(collection, id)))?;
        if let Value::Object(fields) = &mut document.data {
            fields.extend(patch);
        }
        document.updated_at = now;
        debug!(collection, id, "document updated");
        Ok(document.clone())
    }

    fn delete(&self, collection: &str, id: &str) -> CloudResult<()> {
        let now = self.env.enter("document.delete")?;
        let mut state = self.store.lock_at(now);
        state
            .collection_mut(collection)?
            .documents
            .remove(id)
            .ok_or_else(|| CloudError::not_found(document_id(collection, id)))?;
        debug!(collection, id, "document deleted");
        Ok(())
    }

    fn query(&self, collection: &str, query: &DocumentQuery) -> CloudResult<Vec<Document>> {
        let now = self.env.enter("document.query")?;
        let mut state = self.store.lock_at(now);
        let source = state.collection_mut(collection)?;
        let mut results: Vec<Document> = source.matching(&query.filter).cloned().collect();
        if let Some((path, order)) = &query.sort {
            results.sort_by(|a, b| sort_order(lookup(&a.data, path), lookup(&b.data, path), *order));
        }
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    fn count(&self, collection: &str, filter: &Filter) -> CloudResult<u64> {
        let now = self.env.enter("document.count")?;
        let mut state = self.store.lock_at(now);
        Ok(state.collection_mut(collection)?.matching(filter).count() as u64)
    }
}
