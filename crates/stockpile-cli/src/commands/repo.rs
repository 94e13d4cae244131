use super::{colorize_state, json_pretty, lock_store, open_inventory, EXIT_SUCCESS};
use std::path::Path;

pub fn add(
    store_path: &Path,
    address: &str,
    title: Option<&str>,
    token: Option<&str>,
    json: bool,
) -> Result<u8, String> {
    let _lock = lock_store(store_path)?;
    let inventory = open_inventory(store_path)?;
    let info = inventory
        .add_repository(address, title, token)
        .map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&info)?);
    } else {
        println!("added repository '{}' ({})", info.title, info.id);
        println!("run 'stockpile update' to fetch its items");
    }
    Ok(EXIT_SUCCESS)
}

pub fn remove(store_path: &Path, key: &str, json: bool) -> Result<u8, String> {
    let _lock = lock_store(store_path)?;
    let inventory = open_inventory(store_path)?;
    let id = inventory
        .resolve_repository(key)
        .map_err(|e| e.to_string())?;
    let info = inventory.repository(id).map_err(|e| e.to_string())?;
    inventory.remove_repository(id).map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({
            "removed": id,
            "title": info.title,
            "items": info.items,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("removed repository '{}' ({} items)", info.title, info.items);
    }
    Ok(EXIT_SUCCESS)
}

pub fn set_enabled(store_path: &Path, key: &str, enabled: bool, json: bool) -> Result<u8, String> {
    let _lock = lock_store(store_path)?;
    let inventory = open_inventory(store_path)?;
    let id = inventory
        .resolve_repository(key)
        .map_err(|e| e.to_string())?;
    let info = inventory
        .set_repository_enabled(id, enabled)
        .map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&info)?);
    } else {
        let verb = if enabled { "enabled" } else { "disabled" };
        println!("{verb} repository '{}'", info.title);
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(store_path: &Path, json: bool) -> Result<u8, String> {
    let inventory = open_inventory(store_path)?;
    let repos = inventory.repositories();
    if json {
        println!("{}", json_pretty(&repos)?);
    } else if repos.is_empty() {
        println!("no repositories configured");
    } else {
        println!(
            "{:<10} {:<24} {:<14} {:>6}  {:<20} ADDRESS",
            "ID", "TITLE", "STATE", "ITEMS", "UPDATED"
        );
        for repo in &repos {
            let id = repo.id.to_string();
            let updated = repo.last_updated.map_or_else(
                || "never".to_owned(),
                |t| t.format("%Y-%m-%d %H:%M").to_string(),
            );
            let state = if repo.enabled {
                repo.state.to_string()
            } else {
                "disabled".to_owned()
            };
            println!(
                "{:<10} {:<24} {:<14} {:>6}  {:<20} {}",
                &id[..8],
                repo.title,
                colorize_state(&state),
                repo.items,
                updated,
                repo.address
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
