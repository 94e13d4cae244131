use super::{colorize_state, json_pretty, open_inventory, EXIT_SUCCESS};
use stockpile_core::InventoryItem;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    All,
    Installed,
    Updates,
}

impl Filter {
    fn keep(self, item: &InventoryItem) -> bool {
        match self {
            Filter::All => true,
            Filter::Installed => item.state.installed_version().is_some(),
            Filter::Updates => item.update_available(),
        }
    }
}

pub fn run(store_path: &Path, filter: Filter, json: bool) -> Result<u8, String> {
    let inventory = open_inventory(store_path)?;
    let items: Vec<InventoryItem> = inventory
        .items()
        .into_iter()
        .filter(|item| filter.keep(item))
        .collect();

    if json {
        let payload: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "id": item.id(),
                    "name": item.item.name,
                    "version_code": item.item.version_code,
                    "version_name": item.item.version_name,
                    "repository": item.repository,
                    "state": item.state,
                    "update_available": item.update_available(),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if items.is_empty() {
        println!("no items found");
    } else {
        println!("{:<32} {:<24} {:<12} STATE", "ID", "NAME", "VERSION");
        for item in &items {
            let mut state = colorize_state(&item.state.to_string());
            if item.update_available() {
                state.push_str(" [update]");
            }
            println!(
                "{:<32} {:<24} {:<12} {}",
                item.id(),
                item.item.name,
                item.item.version_name,
                state
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
