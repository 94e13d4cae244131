use crate::lifecycle::ItemState;
use serde::{Deserialize, Serialize};
use stockpile_schema::{ItemId, Repository, RepositoryItem};
use stockpile_store::InstalledRecord;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A repository item together with its live installed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub repository: Uuid,
    pub item: RepositoryItem,
    pub state: ItemState,
}

impl InventoryItem {
    pub fn new(
        repository: Uuid,
        item: RepositoryItem,
        installed: Option<&InstalledRecord>,
    ) -> Self {
        Self {
            repository,
            item,
            state: ItemState::seed(installed),
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.item.id
    }

    /// Installed, but the repository offers a newer version.
    pub fn update_available(&self) -> bool {
        self.state
            .installed_version()
            .is_some_and(|v| v < self.item.version_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "id", rename_all = "snake_case")]
pub enum MergeEvent {
    ItemBecameVisible(ItemId),
    ItemBecameInvisible(ItemId),
    ItemChanged(ItemId),
}

pub type ItemView = BTreeMap<ItemId, InventoryItem>;

/// Fold a new snapshot into the live view of one repository.
///
/// Runs three passes over `repository.items_newest()`: ids new to the
/// view become visible, ids missing from the snapshot become invisible,
/// and ids whose snapshot `version_code` is strictly greater are replaced.
/// Events come out in that pass order, ascending by id within a pass.
/// New and replaced items are seeded from `installed`; an item with an
/// operation in flight keeps its state.
pub fn merge_repository(
    current: &ItemView,
    repository_id: Uuid,
    repository: &Repository,
    installed: &BTreeMap<ItemId, InstalledRecord>,
) -> (ItemView, Vec<MergeEvent>) {
    let newest = repository.items_newest();
    let mut view = current.clone();
    let mut events = Vec::new();

    for (id, item) in &newest {
        if !view.contains_key(id) {
            view.insert(
                id.clone(),
                InventoryItem::new(repository_id, item.clone(), installed.get(id)),
            );
            events.push(MergeEvent::ItemBecameVisible(id.clone()));
        }
    }

    let gone: Vec<ItemId> = current
        .keys()
        .filter(|id| !newest.contains_key(*id))
        .cloned()
        .collect();
    for id in gone {
        view.remove(&id);
        events.push(MergeEvent::ItemBecameInvisible(id));
    }

    for (id, item) in &newest {
        let Some(existing) = current.get(id) else {
            continue;
        };
        if item.version_code > existing.item.version_code {
            let state = if existing.state.is_operating() {
                existing.state.clone()
            } else {
                ItemState::seed(installed.get(id))
            };
            view.insert(
                id.clone(),
                InventoryItem {
                    repository: repository_id,
                    item: item.clone(),
                    state,
                },
            );
            events.push(MergeEvent::ItemChanged(id.clone()));
        }
    }

    (view, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use stockpile_schema::{ContentHash, SourceUri};

    fn item(id: &str, version_code: u64) -> RepositoryItem {
        RepositoryItem {
            id: ItemId::new(id),
            version_code,
            version_name: format!("{version_code}.0"),
            name: id.to_uppercase(),
            source: SourceUri::new(format!("{id}-{version_code}.pkg")),
            hash: ContentHash::of_bytes(format!("{id}{version_code}").as_bytes()),
        }
    }

    fn repo(items: Vec<RepositoryItem>) -> Repository {
        Repository {
            id: Uuid::nil(),
            title: "test".to_owned(),
            updated: DateTime::<Utc>::UNIX_EPOCH,
            self_uri: SourceUri::new("http://repo.test/repository.json"),
            items,
        }
    }

    fn none() -> BTreeMap<ItemId, InstalledRecord> {
        BTreeMap::new()
    }

    fn id(s: &str) -> ItemId {
        ItemId::new(s)
    }

    #[test]
    fn first_merge_makes_everything_visible() {
        let (view, events) = merge_repository(
            &ItemView::new(),
            Uuid::nil(),
            &repo(vec![item("b", 1), item("a", 1)]),
            &none(),
        );
        assert_eq!(view.len(), 2);
        assert_eq!(
            events,
            vec![
                MergeEvent::ItemBecameVisible(id("a")),
                MergeEvent::ItemBecameVisible(id("b"))
            ]
        );
    }

    #[test]
    fn merge_is_idempotent() {
        let snapshot = repo(vec![item("a", 1), item("b", 2)]);
        let (view, _) = merge_repository(&ItemView::new(), Uuid::nil(), &snapshot, &none());
        let (again, events) = merge_repository(&view, Uuid::nil(), &snapshot, &none());
        assert!(events.is_empty());
        assert_eq!(again, view);
    }

    #[test]
    fn upgrade_and_addition_in_one_merge() {
        let (view, _) =
            merge_repository(&ItemView::new(), Uuid::nil(), &repo(vec![item("a", 1)]), &none());
        let (view, events) = merge_repository(
            &view,
            Uuid::nil(),
            &repo(vec![item("a", 2), item("b", 1)]),
            &none(),
        );
        assert_eq!(
            events,
            vec![
                MergeEvent::ItemBecameVisible(id("b")),
                MergeEvent::ItemChanged(id("a"))
            ]
        );
        assert_eq!(view[&id("a")].item.version_code, 2);
    }

    #[test]
    fn removal_and_order_of_passes() {
        let (view, _) = merge_repository(
            &ItemView::new(),
            Uuid::nil(),
            &repo(vec![item("a", 1), item("c", 1)]),
            &none(),
        );
        let (_, events) = merge_repository(
            &view,
            Uuid::nil(),
            &repo(vec![item("c", 5), item("b", 1)]),
            &none(),
        );
        assert_eq!(
            events,
            vec![
                MergeEvent::ItemBecameVisible(id("b")),
                MergeEvent::ItemBecameInvisible(id("a")),
                MergeEvent::ItemChanged(id("c")),
            ]
        );
    }

    #[test]
    fn equal_or_lower_version_is_not_a_change() {
        let (view, _) =
            merge_repository(&ItemView::new(), Uuid::nil(), &repo(vec![item("a", 3)]), &none());
        let (_, events) =
            merge_repository(&view, Uuid::nil(), &repo(vec![item("a", 3)]), &none());
        assert!(events.is_empty());
        let (kept, events) =
            merge_repository(&view, Uuid::nil(), &repo(vec![item("a", 2)]), &none());
        assert!(events.is_empty());
        assert_eq!(kept[&id("a")].item.version_code, 3);
    }

    #[test]
    fn state_seeded_from_installed_facts() {
        let mut installed = BTreeMap::new();
        installed.insert(
            id("a"),
            InstalledRecord {
                version_code: 1,
                version_name: "1.0".to_owned(),
                last_updated: DateTime::<Utc>::UNIX_EPOCH,
            },
        );
        let (view, _) =
            merge_repository(&ItemView::new(), Uuid::nil(), &repo(vec![item("a", 2)]), &installed);
        assert_eq!(view[&id("a")].state.installed_version(), Some(1));
        assert!(view[&id("a")].update_available());
    }

    #[test]
    fn operating_item_keeps_state_on_upgrade() {
        let (mut view, _) =
            merge_repository(&ItemView::new(), Uuid::nil(), &repo(vec![item("a", 1)]), &none());
        let busy = ItemState::Operating {
            operation: crate::lifecycle::Operation::Installing,
            progress: stockpile_schema::Progress::status("Downloading"),
        };
        view.get_mut(&id("a")).unwrap().state = busy.clone();
        let (view, events) =
            merge_repository(&view, Uuid::nil(), &repo(vec![item("a", 2)]), &none());
        assert_eq!(events, vec![MergeEvent::ItemChanged(id("a"))]);
        assert_eq!(view[&id("a")].state, busy);
    }

    #[test]
    fn duplicate_ids_use_newest() {
        let snapshot = repo(vec![item("a", 1), item("a", 4), item("a", 2)]);
        let (view, events) = merge_repository(&ItemView::new(), Uuid::nil(), &snapshot, &none());
        assert_eq!(events.len(), 1);
        assert_eq!(view[&id("a")].item.version_code, 4);
    }
}
