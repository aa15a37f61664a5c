use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_by_average_desc, AverageFilter, AverageStore, ReplaceScope};
use crate::error::Result;
use crate::models::ClassroomAverage;

/// Process-local collection, used for development and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    averages: RwLock<Vec<ClassroomAverage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.averages.read().await.len()
    }
}

#[async_trait]
impl AverageStore for MemoryStore {
    async fn replace(&self, averages: &[ClassroomAverage], scope: &ReplaceScope) -> Result<usize> {
        let mut stored = self.averages.write().await;
        stored.retain(|existing| !scope.covers(existing));
        stored.extend_from_slice(averages);
        Ok(averages.len())
    }

    async fn find(&self, filter: &AverageFilter) -> Result<Vec<ClassroomAverage>> {
        let mut found: Vec<ClassroomAverage> = self
            .averages
            .read()
            .await
            .iter()
            .filter(|average| filter.matches(average))
            .cloned()
            .collect();
        sort_by_average_desc(&mut found);
        Ok(found)
    }
}
