//! Server-side item annotations, refreshed as the last step of a full
//! session refresh.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{info, instrument};

use super::collection::canonical_server_path;
use crate::errors::ServiceError;
use crate::models::Annotation;
use crate::service::VersionControlService;

pub struct AnnotationCache {
    service: Arc<dyn VersionControlService>,
    /// Canonical server path -> annotations on that item.
    annotations: RwLock<BTreeMap<String, Vec<Annotation>>>,
}

impl AnnotationCache {
    pub fn new(service: Arc<dyn VersionControlService>) -> Self {
        Self {
            service,
            annotations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replace the cached annotations. On error the previous set is kept.
    #[instrument(skip(self))]
    pub fn refresh(&self) -> Result<usize, ServiceError> {
        let fresh = self.service.query_annotations()?;
        let count = fresh.len();
        let mut grouped: BTreeMap<String, Vec<Annotation>> = BTreeMap::new();
        for annotation in fresh {
            grouped
                .entry(canonical_server_path(&annotation.server_path))
                .or_default()
                .push(annotation);
        }
        *self.annotations.write().unwrap_or_else(|e| e.into_inner()) = grouped;

        info!(count, "annotation cache refreshed");
        Ok(count)
    }

    pub fn for_item(&self, server_path: &str) -> Vec<Annotation> {
        self.annotations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&canonical_server_path(server_path))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, server_path: &str, name: &str) -> Option<String> {
        self.for_item(server_path)
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.value)
    }

    pub fn len(&self) -> usize {
        self.annotations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AnnotationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationCache").field("len", &self.len()).finish()
    }
}
