use super::{json_pretty, lock_store, open_inventory, EXIT_SUCCESS};
use std::path::Path;

pub fn run(store_path: &Path, json: bool) -> Result<u8, String> {
    let _lock = lock_store(store_path)?;
    let inventory = open_inventory(store_path)?;
    let cleared = inventory.clear_cache().map_err(|e| e.to_string())?;
    let bytes: u64 = cleared.iter().map(|f| f.size).sum();
    if json {
        let files: Vec<serde_json::Value> = cleared
            .iter()
            .map(|f| {
                serde_json::json!({
                    "file": f.file,
                    "hash": f.hash,
                    "size": f.size,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "removed": files,
            "bytes": bytes,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("removed {} cached packages ({bytes} bytes)", cleared.len());
    }
    Ok(EXIT_SUCCESS)
}
