//! Task store seam.
//!
//! The board owns task CRUD; the orchestrator only reads tasks and moves
//! them between columns as attempts progress.

use async_trait::async_trait;
use crew_core::{Id, Task, TaskStatus};

use crate::storage::{Storage, StorageError};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch a task; `None` if it does not exist.
    async fn fetch(&self, id: &Id) -> Result<Option<Task>, StorageError>;

    /// Tasks of a project in an admissible column, oldest first.
    async fn list_runnable(&self, project_id: &Id) -> Result<Vec<Task>, StorageError>;

    async fn set_status(&self, id: &Id, status: TaskStatus) -> Result<(), StorageError>;
}

#[async_trait]
impl TaskStore for Storage {
    async fn fetch(&self, id: &Id) -> Result<Option<Task>, StorageError> {
        match self.get_task(id).await {
            Ok(task) => Ok(Some(task)),
            Err(StorageError::TaskNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_runnable(&self, project_id: &Id) -> Result<Vec<Task>, StorageError> {
        self.list_runnable_tasks(project_id).await
    }

    async fn set_status(&self, id: &Id, status: TaskStatus) -> Result<(), StorageError> {
        self.update_task_status(id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::*;

    #[tokio::test]
    async fn fetch_missing_task_is_none() {
        let ts = create_test_storage().await;
        let store: &dyn TaskStore = ts.storage.as_ref();
        assert!(store.fetch(&Id::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_runnable_excludes_done_and_cancelled() {
        let ts = create_test_storage().await;
        let project = seed_project(&ts.storage, "/tmp/repo").await;
        let todo = seed_task(&ts.storage, &project, TaskStatus::Todo).await;
        let review = seed_task(&ts.storage, &project, TaskStatus::InReview).await;
        seed_task(&ts.storage, &project, TaskStatus::Done).await;
        seed_task(&ts.storage, &project, TaskStatus::Cancelled).await;

        let store: &dyn TaskStore = ts.storage.as_ref();
        let ids: Vec<Id> = store
            .list_runnable(&project.id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![todo.id.clone(), review.id]);

        store.set_status(&todo.id, TaskStatus::Done).await.unwrap();
        assert_eq!(store.list_runnable(&project.id).await.unwrap().len(), 1);
    }
}
