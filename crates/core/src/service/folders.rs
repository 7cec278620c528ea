use std::collections::HashSet;

use arbor_storage::{FolderRecord, WriteBatch, now_unix_ms};
use snafu::{OptionExt, ResultExt, ensure};

use super::ConversationService;
use crate::error::{EngineResult, InvalidStateSnafu, NotFoundSnafu, StorageSnafu};
use crate::message::{Folder, FolderId};

impl ConversationService {
    /// Appends a folder after the existing ones.
    pub async fn create_folder(&self, name: &str) -> EngineResult<Folder> {
        let stage = "create-folder";
        self.ensure_ready(stage)?;
        let name = folder_name(name, stage)?;
        let _guard = self.folder_lock.lock().await;

        let existing = self.load_folders(stage).await?;
        let position = existing
            .iter()
            .map(|folder| folder.position + 1)
            .max()
            .unwrap_or(0);
        let folder = Folder {
            id: FolderId::new_v7(),
            name,
            position,
            created_at_unix_ms: now_unix_ms(),
        };

        let mut batch = WriteBatch::new();
        batch.put_folder(FolderRecord::from(&folder));
        self.storage
            .commit(batch)
            .await
            .context(StorageSnafu { stage })?;
        tracing::debug!(folder_id = %folder.id, position, "folder created");
        Ok(folder)
    }

    pub async fn rename_folder(&self, folder_id: FolderId, name: &str) -> EngineResult<Folder> {
        let stage = "rename-folder";
        self.ensure_ready(stage)?;
        let name = folder_name(name, stage)?;
        let _guard = self.folder_lock.lock().await;

        let mut folder = self.require_folder(folder_id, stage).await?;
        folder.name = name;
        let mut batch = WriteBatch::new();
        batch.put_folder(FolderRecord::from(&folder));
        self.storage
            .commit(batch)
            .await
            .context(StorageSnafu { stage })?;
        Ok(folder)
    }

    /// Assigns positions in the given order; `ordered` must name every folder exactly once.
    pub async fn reorder_folders(&self, ordered: &[FolderId]) -> EngineResult<Vec<Folder>> {
        let stage = "reorder-folders";
        self.ensure_ready(stage)?;
        let _guard = self.folder_lock.lock().await;

        let existing = self.load_folders(stage).await?;
        let known = existing.iter().map(|folder| folder.id).collect::<HashSet<_>>();
        let requested = ordered.iter().copied().collect::<HashSet<_>>();
        ensure!(
            requested.len() == ordered.len() && requested == known,
            InvalidStateSnafu {
                stage,
                details: "folder order must list every folder exactly once",
            }
        );

        let mut reordered = Vec::with_capacity(ordered.len());
        let mut batch = WriteBatch::new();
        for (position, folder_id) in ordered.iter().enumerate() {
            if let Some(folder) = existing.iter().find(|folder| folder.id == *folder_id) {
                let folder = Folder {
                    position: position as u32,
                    ..folder.clone()
                };
                batch.put_folder(FolderRecord::from(&folder));
                reordered.push(folder);
            }
        }
        self.storage
            .commit(batch)
            .await
            .context(StorageSnafu { stage })?;
        Ok(reordered)
    }

    /// Ordered by position.
    pub async fn list_folders(&self) -> EngineResult<Vec<Folder>> {
        let stage = "list-folders";
        self.ensure_ready(stage)?;
        self.load_folders(stage).await
    }

    /// Detaches member conversations one at a time, then removes the folder.
    pub async fn delete_folder(&self, folder_id: FolderId) -> EngineResult<()> {
        let stage = "delete-folder";
        self.ensure_ready(stage)?;
        self.require_folder(folder_id, stage).await?;

        let members = self
            .list_conversations()
            .await?
            .into_iter()
            .filter(|summary| summary.folder_id == Some(folder_id))
            .collect::<Vec<_>>();
        for summary in &members {
            self.move_conversation_to_folder(summary.id, None).await?;
        }

        let _guard = self.folder_lock.lock().await;
        let mut batch = WriteBatch::new();
        batch.delete_folder(folder_id);
        self.storage
            .commit(batch)
            .await
            .context(StorageSnafu { stage })?;
        tracing::debug!(folder_id = %folder_id, detached = members.len(), "folder deleted");
        Ok(())
    }

    pub(super) async fn require_folder(
        &self,
        folder_id: FolderId,
        stage: &'static str,
    ) -> EngineResult<Folder> {
        let record = self
            .storage
            .get_folder(folder_id)
            .await
            .context(StorageSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "folder",
                id: folder_id.to_string(),
            })?;
        Ok(Folder::from(record))
    }

    async fn load_folders(&self, stage: &'static str) -> EngineResult<Vec<Folder>> {
        let records = self
            .storage
            .list_folders()
            .await
            .context(StorageSnafu { stage })?;
        Ok(records.into_iter().map(Folder::from).collect())
    }
}

fn folder_name(name: &str, stage: &'static str) -> EngineResult<String> {
    let name = name.trim();
    ensure!(
        !name.is_empty(),
        InvalidStateSnafu {
            stage,
            details: "folder name is empty",
        }
    );
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::message::FolderId;
    use crate::test_support::ready_service;

    #[tokio::test]
    async fn folders_are_created_in_order_and_reordered() {
        let (service, _) = ready_service().await;
        let work = service.create_folder("Work").await.expect("work");
        let home = service.create_folder(" Home ").await.expect("home");
        assert_eq!((work.position, home.position), (0, 1));
        assert_eq!(home.name, "Home");

        let reordered = service
            .reorder_folders(&[home.id, work.id])
            .await
            .expect("reordered");
        assert_eq!(reordered[0].id, home.id);

        let listed = service.list_folders().await.expect("listed");
        assert_eq!(
            listed.iter().map(|folder| folder.id).collect::<Vec<_>>(),
            vec![home.id, work.id]
        );

        let error = service
            .reorder_folders(&[home.id])
            .await
            .expect_err("incomplete order");
        assert_eq!(error.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn deleting_a_folder_detaches_its_conversations() {
        let (service, storage) = ready_service().await;
        let folder = service.create_folder("Work").await.expect("folder");
        let inside = service
            .create_conversation("inside", Some(folder.id))
            .await
            .expect("inside");
        let outside = service.create_conversation("outside", None).await.expect("outside");
        let before = storage.batches().len();

        service.delete_folder(folder.id).await.expect("deleted");

        // One write per detached conversation plus the folder removal.
        assert_eq!(storage.batches().len(), before + 2);
        let inside = service.get_conversation(inside.id).await.expect("inside");
        assert_eq!(inside.folder_id, None);
        let outside = service.get_conversation(outside.id).await.expect("outside");
        assert_eq!(outside.folder_id, None);
        assert!(service.list_folders().await.expect("listed").is_empty());
    }

    #[tokio::test]
    async fn unknown_folders_are_not_found() {
        let (service, _) = ready_service().await;
        let error = service
            .create_conversation("t", Some(FolderId::new_v7()))
            .await
            .expect_err("unknown folder");
        assert_eq!(error.kind(), ErrorKind::NotFound);

        let error = service
            .rename_folder(FolderId::new_v7(), "x")
            .await
            .expect_err("unknown folder");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }
}
