use super::{json_pretty, open_inventory, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;

pub fn run(store_path: &Path, json: bool) -> Result<u8, String> {
    let inventory = open_inventory(store_path)?;
    let report = inventory.verify_cache().map_err(|e| e.to_string())?;

    if json {
        let failed: Vec<serde_json::Value> = report
            .failed
            .iter()
            .map(|f| {
                serde_json::json!({
                    "hash": f.hash,
                    "reason": f.reason,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "checked": report.checked,
            "passed": report.passed,
            "failed": failed,
            "skipped": report.skipped,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "checked {} cached packages: {} passed, {} failed, {} skipped",
            report.checked,
            report.passed,
            report.failed.len(),
            report.skipped.len()
        );
        for failure in &report.failed {
            println!("  corrupt {}: {}", failure.hash.short(), failure.reason);
        }
    }
    if report.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_FAILURE)
    }
}
