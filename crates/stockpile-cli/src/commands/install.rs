use super::{lock_store, open_inventory, report_outcome, show_progress, spinner, wait_for};
use stockpile_schema::ItemId;
use std::path::Path;

pub fn run(
    store_path: &Path,
    item: &str,
    repo: Option<&str>,
    json: bool,
    verbose: bool,
) -> Result<u8, String> {
    let _lock = lock_store(store_path)?;
    let inventory = open_inventory(store_path)?;
    let id = ItemId::new(item);
    let repository = repo
        .map(|key| inventory.resolve_repository(key))
        .transpose()
        .map_err(|e| e.to_string())?;

    let events = inventory.subscribe();
    let completion = inventory
        .install(&id, repository)
        .map_err(|e| e.to_string())?;
    let pb = (!json).then(|| spinner(&format!("installing {id}...")));
    let outcome = wait_for(
        &completion,
        || {
            inventory.cancel(&id);
        },
        || {
            if let Some(pb) = &pb {
                show_progress(pb, &events, &id);
            }
        },
    );
    report_outcome(&outcome, pb.as_ref(), &format!("install {id}"), json, verbose)
}
