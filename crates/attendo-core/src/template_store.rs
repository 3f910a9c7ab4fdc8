use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::CoreError;
use crate::types::{BiometricTemplate, Descriptor};

/// Durable source of enrolled templates.
pub trait TemplateRepository {
    type Error: std::error::Error + Send + Sync + 'static;

    fn load(&self) -> impl Future<Output = Result<Vec<BiometricTemplate>, Self::Error>> + Send;

    fn save(
        &self,
        template: &BiometricTemplate,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// In-memory set of enrolled templates with a fixed descriptor dimension.
///
/// Recognition takes read snapshots; enrollment writes take the lock
/// exclusively. Templates are shared behind `Arc` so a snapshot costs one
/// pointer copy per identity, not a descriptor copy.
pub struct TemplateStore {
    dimension: usize,
    templates: RwLock<HashMap<String, Arc<BiometricTemplate>>>,
}

/// Point-in-time view of the store, iterable any number of times.
#[derive(Clone, Default)]
pub struct TemplateSnapshot {
    templates: Vec<Arc<BiometricTemplate>>,
}

impl TemplateSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Descriptor)> + '_ {
        self.templates
            .iter()
            .map(|t| (t.identity.as_str(), &t.descriptor))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl TemplateStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Identity → descriptor mapping of everything enrolled.
    pub fn load(&self) -> HashMap<String, Descriptor> {
        self.read()
            .iter()
            .map(|(id, t)| (id.clone(), t.descriptor.clone()))
            .collect()
    }

    /// Snapshot for a linear scan. Order is unspecified.
    pub fn iterate(&self) -> TemplateSnapshot {
        TemplateSnapshot {
            templates: self.read().values().cloned().collect(),
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<BiometricTemplate>> {
        self.read().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Insert or replace a template. On error the store is unchanged.
    pub fn upsert(&self, template: BiometricTemplate) -> Result<(), CoreError> {
        if template.identity.is_empty() {
            return Err(CoreError::EmptyIdentity);
        }
        template.descriptor.validate(self.dimension)?;

        let identity = template.identity.clone();
        let replaced = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), Arc::new(template))
            .is_some();
        tracing::info!(identity = %identity, replaced, "template stored");
        Ok(())
    }

    pub fn remove(&self, identity: &str) -> bool {
        let removed = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
            .is_some();
        if removed {
            tracing::info!(identity, "template removed");
        }
        removed
    }

    /// Replace the whole store with what `repo` holds. Templates of the wrong
    /// dimension are skipped. Returns the number loaded.
    pub async fn load_from<R: TemplateRepository>(&self, repo: &R) -> Result<usize, R::Error> {
        let rows = repo.load().await?;

        let mut fresh = HashMap::with_capacity(rows.len());
        for template in rows {
            if let Err(e) = template.descriptor.validate(self.dimension) {
                tracing::warn!(identity = %template.identity, error = %e, "skipping stored template");
                continue;
            }
            fresh.insert(template.identity.clone(), Arc::new(template));
        }

        let count = fresh.len();
        *self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::info!(count, dimension = self.dimension, "templates loaded");
        Ok(count)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<BiometricTemplate>>> {
        self.templates.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn template(identity: &str, values: Vec<f32>) -> BiometricTemplate {
        BiometricTemplate {
            identity: identity.to_string(),
            descriptor: Descriptor::new(values),
            sample_count: 15,
            created_at: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn test_upsert_and_load() {
        let store = TemplateStore::new(4);
        store.upsert(template("alice", vec![0.0; 4])).unwrap();
        store.upsert(template("bob", vec![1.0; 4])).unwrap();

        let all = store.load();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bob"].values(), &[1.0; 4]);
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_unchanged() {
        let store = TemplateStore::new(4);
        store.upsert(template("alice", vec![0.0; 4])).unwrap();

        let err = store.upsert(template("alice", vec![9.0; 3])).unwrap_err();
        assert_eq!(
            err,
            CoreError::DimensionMismatch {
                expected: 4,
                got: 3
            }
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("alice").unwrap().descriptor.values(), &[0.0; 4]);
    }

    #[test]
    fn test_reenrollment_replaces_wholesale() {
        let store = TemplateStore::new(2);
        store.upsert(template("alice", vec![0.0, 0.0])).unwrap();
        let mut replacement = template("alice", vec![0.5, 0.5]);
        replacement.sample_count = 30;
        store.upsert(replacement.clone()).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(*store.get("alice").unwrap(), replacement);
    }

    #[test]
    fn test_rejects_empty_identity() {
        let store = TemplateStore::new(2);
        assert_eq!(
            store.upsert(template("", vec![0.0, 0.0])),
            Err(CoreError::EmptyIdentity)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_is_restartable() {
        let store = TemplateStore::new(1);
        store.upsert(template("a", vec![1.0])).unwrap();
        store.upsert(template("b", vec![2.0])).unwrap();

        let snapshot = store.iterate();
        let first: Vec<_> = snapshot.iter().map(|(id, _)| id.to_string()).collect();
        let second: Vec<_> = snapshot.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(first, second);
        assert_eq!(snapshot.len(), 2);

        // Later writes do not affect an existing snapshot.
        store.remove("a");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(store.iterate().len(), 1);
    }

    struct FixedRepo(Vec<BiometricTemplate>);

    #[derive(Debug, thiserror::Error)]
    #[error("unused")]
    struct Never;

    impl TemplateRepository for FixedRepo {
        type Error = Never;

        async fn load(&self) -> Result<Vec<BiometricTemplate>, Never> {
            Ok(self.0.clone())
        }

        async fn save(&self, _template: &BiometricTemplate) -> Result<(), Never> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_load_from_skips_wrong_dimension() {
        let store = TemplateStore::new(2);
        store.upsert(template("stale", vec![0.0, 0.0])).unwrap();
        let repo = FixedRepo(vec![
            template("alice", vec![0.0, 1.0]),
            template("broken", vec![0.0, 1.0, 2.0]),
        ]);

        let loaded = store.load_from(&repo).await.unwrap();
        assert_eq!(loaded, 1);
        assert!(store.get("alice").is_some());
        assert!(store.get("broken").is_none());
        assert!(store.get("stale").is_none());
    }
}
