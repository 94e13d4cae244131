//! Display strings for step descriptions, statuses and failure codes.
//!
//! The core never interprets these strings. Front ends may implement
//! [`Messages`] to localize them; [`EnglishMessages`] uses the defaults.

use std::time::Duration;

pub trait Messages: Send + Sync {
    fn update_repository(&self, title: &str) -> String {
        format!("Update repository {title}")
    }

    fn fetch_manifest(&self, attempt: u32) -> String {
        if attempt == 0 {
            "Fetch repository manifest".to_owned()
        } else {
            format!("Fetch repository manifest (retry {attempt})")
        }
    }

    fn parse_manifest(&self) -> String {
        "Parse repository manifest".to_owned()
    }

    fn merge_repository(&self) -> String {
        "Merge repository items".to_owned()
    }

    fn reserve(&self, name: &str) -> String {
        format!("Reserve download slot for {name}")
    }

    fn download(&self, name: &str, attempt: u32) -> String {
        if attempt == 0 {
            format!("Download {name}")
        } else {
            format!("Download {name} (retry {attempt})")
        }
    }

    fn verify(&self, name: &str) -> String {
        format!("Verify {name}")
    }

    fn install(&self, name: &str) -> String {
        format!("Install {name}")
    }

    fn uninstall(&self, name: &str) -> String {
        format!("Uninstall {name}")
    }

    fn cleanup(&self, name: &str) -> String {
        format!("Delete downloaded file of {name}")
    }

    fn pause(&self, delay: Duration) -> String {
        format!("Wait {}s before retrying", delay.as_secs())
    }

    fn status_downloading(&self) -> String {
        "Downloading".to_owned()
    }

    fn status_verifying(&self) -> String {
        "Verifying".to_owned()
    }

    fn status_installing(&self) -> String {
        "Installing".to_owned()
    }

    fn status_uninstalling(&self) -> String {
        "Uninstalling".to_owned()
    }

    fn status_waiting(&self) -> String {
        "Waiting to retry".to_owned()
    }

    fn status_queued(&self) -> String {
        "Queued".to_owned()
    }

    fn cancelled(&self) -> String {
        "Cancelled".to_owned()
    }

    fn done(&self) -> String {
        "Done".to_owned()
    }

    /// Explanation for an installer failure code.
    fn install_failure(&self, code: &str) -> String {
        match code {
            "conflict" => "Another operation on this package is in progress".to_owned(),
            "storage" => "The installer could not write the package".to_owned(),
            "invalid" => "The package file was rejected by the installer".to_owned(),
            "not-installed" => "The package is not installed".to_owned(),
            "incompatible" => "The package is not compatible with this system".to_owned(),
            other => format!("Installation failed ({other})"),
        }
    }

    fn hash_mismatch(&self, expected: &str, actual: &str) -> String {
        format!("Downloaded file has hash {actual}, expected {expected}")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnglishMessages;

impl Messages for EnglishMessages {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_descriptions_number_attempts() {
        let m = EnglishMessages;
        assert_eq!(m.download("editor", 0), "Download editor");
        assert_eq!(m.download("editor", 2), "Download editor (retry 2)");
    }

    #[test]
    fn unknown_install_code_is_quoted() {
        assert_eq!(
            EnglishMessages.install_failure("E42"),
            "Installation failed (E42)"
        );
    }
}
