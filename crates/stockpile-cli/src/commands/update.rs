use super::{
    colorize_state, json_pretty, lock_store, open_inventory, outcome_exit_code, print_steps,
    spin_fail, spin_ok, spinner, wait_for, EXIT_SUCCESS,
};
use stockpile_core::{MergeEvent, Outcome};
use std::path::Path;

pub fn run(store_path: &Path, repo: Option<&str>, json: bool, verbose: bool) -> Result<u8, String> {
    let _lock = lock_store(store_path)?;
    let inventory = open_inventory(store_path)?;

    let started = match repo {
        Some(key) => {
            let id = inventory
                .resolve_repository(key)
                .map_err(|e| e.to_string())?;
            vec![(id, inventory.update(id).map_err(|e| e.to_string())?)]
        }
        None => inventory.update_all(),
    };
    if started.is_empty() {
        if json {
            println!("[]");
        } else {
            println!("no enabled repositories to update");
        }
        return Ok(EXIT_SUCCESS);
    }

    let mut exit = EXIT_SUCCESS;
    let mut results = Vec::new();
    for (id, completion) in started {
        let title = || {
            inventory
                .repository(id)
                .map_or_else(|_| id.to_string(), |info| info.title)
        };
        let pb = (!json).then(|| spinner(&format!("updating {}...", title())));
        let outcome = wait_for(&completion, || inventory.cancel_all(), || {});
        let title = title();
        let code = outcome_exit_code(&outcome);
        exit = exit.max(code);

        let (visible, invisible, changed) = count_events(&outcome);
        if let Some(pb) = &pb {
            let summary = format!(
                "{title}: {} (+{visible} -{invisible} ~{changed})",
                colorize_state(&outcome.status().to_string())
            );
            if outcome.is_succeeded() {
                spin_ok(pb, &summary);
            } else {
                spin_fail(pb, &summary);
            }
            if verbose || outcome.is_failed() {
                print_steps(outcome.steps());
            }
        }
        results.push(serde_json::json!({
            "repository": id,
            "title": title,
            "status": outcome.status(),
            "visible": visible,
            "invisible": invisible,
            "changed": changed,
            "steps": outcome.steps(),
        }));
    }
    if json {
        println!("{}", json_pretty(&results)?);
    }
    Ok(exit)
}

fn count_events(outcome: &Outcome<Vec<MergeEvent>>) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for event in outcome.value().into_iter().flatten() {
        match event {
            MergeEvent::ItemBecameVisible(_) => counts.0 += 1,
            MergeEvent::ItemBecameInvisible(_) => counts.1 += 1,
            MergeEvent::ItemChanged(_) => counts.2 += 1,
        }
    }
    counts
}
