use super::EXIT_SUCCESS;
use clap::{Command, CommandFactory};
use std::path::Path;

pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed to create dir: {e}"))?;
    let cmd = C::command();
    let count = render_tree(dir, "stockpile", &cmd)?;
    println!("{count} man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}

/// Write `<name>.1` for `cmd` and one page per nested subcommand.
fn render_tree(dir: &Path, name: &str, cmd: &Command) -> Result<usize, String> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd.clone())
        .render(&mut buf)
        .map_err(|e| format!("man page render failed: {e}"))?;
    let path = dir.join(format!("{name}.1"));
    std::fs::write(&path, &buf).map_err(|e| format!("failed to write {}: {e}", path.display()))?;

    let mut written = 1;
    for sub in cmd.get_subcommands() {
        if sub.get_name() == "help" {
            continue;
        }
        written += render_tree(dir, &format!("{name}-{}", sub.get_name()), sub)?;
    }
    Ok(written)
}
