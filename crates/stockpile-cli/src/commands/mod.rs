pub mod clear_cache;
pub mod completions;
pub mod install;
pub mod list;
pub mod man_pages;
pub mod repo;
pub mod show;
pub mod uninstall;
pub mod update;
pub mod verify_cache;

use indicatif::{ProgressBar, ProgressStyle};
use stockpile_core::{
    shutdown_requested, Inventory, InventoryEvent, InventoryLock, ItemState, Outcome, Step,
};
use stockpile_installer::Completion;
use stockpile_schema::{ItemId, Progress};
use stockpile_store::StoreLayout;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tracing::debug;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MANIFEST_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_CANCELLED: u8 = 4;

const POLL: Duration = Duration::from_millis(50);

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "idle" => Style::new().green().apply_to(state).to_string(),
        "updating" | "installing" | "uninstalling" => {
            Style::new().cyan().bold().apply_to(state).to_string()
        }
        "not_installed" => Style::new().dim().apply_to(state).to_string(),
        s if s.starts_with("installed") => Style::new().green().apply_to(s).to_string(),
        s if s.starts_with("failed") || s == "update failed" => {
            Style::new().red().apply_to(s).to_string()
        }
        other => other.to_owned(),
    }
}

pub fn open_inventory(store_path: &Path) -> Result<Inventory, String> {
    debug!("opening inventory at {}", store_path.display());
    Inventory::open(StoreLayout::new(store_path)).map_err(|e| e.to_string())
}

pub fn lock_store(store_path: &Path) -> Result<InventoryLock, String> {
    InventoryLock::acquire(&StoreLayout::new(store_path).lock_file())
        .map_err(|e| format!("store lock: {e}"))
}

/// Block until `completion` resolves. Ctrl-C calls `cancel` once and keeps
/// waiting for the cooperative shutdown.
pub fn wait_for<A: Clone>(
    completion: &Completion<Outcome<A>>,
    cancel: impl Fn(),
    mut on_tick: impl FnMut(),
) -> Outcome<A> {
    let mut cancelled = false;
    loop {
        if let Some(outcome) = completion.wait_timeout(POLL) {
            on_tick();
            return outcome;
        }
        on_tick();
        if !cancelled && shutdown_requested() {
            cancelled = true;
            cancel();
        }
    }
}

/// Feed install/uninstall progress of `id` into `pb`.
pub fn show_progress(pb: &ProgressBar, events: &Receiver<InventoryEvent>, id: &ItemId) {
    for event in events.try_iter() {
        let InventoryEvent::ItemStateChanged { id: changed, state } = event else {
            continue;
        };
        if &changed != id {
            continue;
        }
        if let ItemState::Operating { progress, .. } = state {
            render_progress(pb, &progress);
        }
    }
}

fn render_progress(pb: &ProgressBar, progress: &Progress) {
    pb.set_message(progress.status.clone());
    match progress.minor.maximum() {
        Some(total) if total > 0 => {
            if pb.length() != Some(total) {
                pb.set_style(style(
                    "{msg:>12} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
                ));
                pb.set_length(total);
            }
            pb.set_position(progress.minor.current());
        }
        _ => {
            pb.set_style(style("{spinner:.cyan} {msg}"));
            pb.tick();
        }
    }
}

pub fn print_steps(steps: &[Step]) {
    for step in steps {
        let mark = if step.failed { "✗" } else { "·" };
        if step.resolution.is_empty() {
            println!("  {mark} {}", step.description);
        } else {
            println!("  {mark} {}: {}", step.description, step.resolution);
        }
    }
}

/// Print `outcome` and map it to an exit code.
pub fn report_outcome<A>(
    outcome: &Outcome<A>,
    pb: Option<&ProgressBar>,
    action: &str,
    json: bool,
    verbose: bool,
) -> Result<u8, String> {
    let code = outcome_exit_code(outcome);
    if json {
        let payload = serde_json::json!({
            "action": action,
            "status": outcome.status(),
            "steps": outcome.steps(),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(code);
    }
    if let Some(pb) = pb {
        match code {
            EXIT_SUCCESS => spin_ok(pb, &format!("{action} succeeded")),
            EXIT_CANCELLED => spin_fail(pb, &format!("{action} cancelled")),
            _ => spin_fail(pb, &format!("{action} failed")),
        }
    }
    if verbose || outcome.is_failed() {
        print_steps(outcome.steps());
    }
    Ok(code)
}

pub fn outcome_exit_code<A>(outcome: &Outcome<A>) -> u8 {
    match outcome {
        Outcome::Succeeded { .. } => EXIT_SUCCESS,
        Outcome::Cancelled { .. } => EXIT_CANCELLED,
        Outcome::Failed { .. } => {
            let code = outcome
                .last_failure()
                .and_then(|s| s.error.as_ref())
                .map(|e| e.code.as_str());
            match code {
                Some("manifest" | "id-mismatch") => EXIT_MANIFEST_ERROR,
                Some("storage" | "hash-mismatch" | "reservation-unavailable") => EXIT_STORE_ERROR,
                _ => EXIT_FAILURE,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockpile_core::StepError;

    fn failed(code: &str) -> Outcome<()> {
        Outcome::Failed {
            steps: vec![Step::failure("x", StepError::new(code, "broken"))],
        }
    }

    #[test]
    fn json_pretty_serializes_string() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_state_keeps_text() {
        for state in ["idle", "updating", "installed (1.0)", "failed (installing)", "other"] {
            assert!(colorize_state(state).contains(state));
        }
        assert_eq!(colorize_state("unknown"), "unknown");
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_MANIFEST_ERROR,
            EXIT_STORE_ERROR,
            EXIT_CANCELLED,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(codes[i + 1..].iter().all(|b| a != b));
        }
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(outcome_exit_code(&Outcome::succeeded((), vec![])), EXIT_SUCCESS);
        assert_eq!(
            outcome_exit_code(&Outcome::<()>::Cancelled { steps: vec![] }),
            EXIT_CANCELLED
        );
        assert_eq!(outcome_exit_code(&failed("manifest")), EXIT_MANIFEST_ERROR);
        assert_eq!(outcome_exit_code(&failed("hash-mismatch")), EXIT_STORE_ERROR);
        assert_eq!(outcome_exit_code(&failed("server-error")), EXIT_FAILURE);
    }

    #[test]
    fn wait_for_returns_resolved_outcome() {
        let completion = Completion::resolved(Outcome::succeeded(7u8, vec![]));
        let mut ticks = 0;
        let outcome = wait_for(&completion, || {}, || ticks += 1);
        assert_eq!(outcome.value(), Some(&7));
        assert_eq!(ticks, 1);
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
    }

    #[test]
    fn progress_sets_length_for_definite_values() {
        let pb = ProgressBar::hidden();
        render_progress(
            &pb,
            &Progress::new(
                None,
                stockpile_schema::ProgressValue::definite(50, 10, 200),
                "Downloading",
            ),
        );
        assert_eq!(pb.length(), Some(200));
        assert_eq!(pb.position(), 50);
    }
}
