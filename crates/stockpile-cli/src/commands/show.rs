use super::{colorize_state, json_pretty, open_inventory, print_steps, EXIT_SUCCESS};
use stockpile_core::ItemState;
use stockpile_schema::ItemId;
use std::path::Path;

pub fn run(store_path: &Path, item: &str, json: bool) -> Result<u8, String> {
    let inventory = open_inventory(store_path)?;
    let id = ItemId::new(item);
    let Some(best) = inventory.item(&id) else {
        return Err(format!("item not found: {id}"));
    };
    let offers: Vec<_> = inventory
        .items()
        .into_iter()
        .filter(|candidate| candidate.id() == &id)
        .collect();

    if json {
        let payload = serde_json::json!({
            "item": best,
            "update_available": best.update_available(),
            "offers": offers,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("id:       {}", best.id());
    println!("name:     {}", best.item.name);
    println!(
        "version:  {} ({})",
        best.item.version_name, best.item.version_code
    );
    println!("state:    {}", colorize_state(&best.state.to_string()));
    if best.update_available() {
        println!("update:   available");
    }
    println!("hash:     {}", best.item.hash);
    println!("source:   {}", best.item.source);
    if offers.len() > 1 {
        println!("offered by:");
        for offer in &offers {
            let title = inventory
                .repository(offer.repository)
                .map_or_else(|_| offer.repository.to_string(), |info| info.title);
            println!("  {title}: {}", offer.item.version_name);
        }
    }
    if let ItemState::Failed { steps, .. } = &best.state {
        println!("last attempt:");
        print_steps(steps);
    }
    Ok(EXIT_SUCCESS)
}
