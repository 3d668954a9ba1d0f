//! External tool availability detection.
//!
//! The production gateway delegates every IAM mutation to the `gcloud` CLI.
//! Rather than failing with an opaque OS error ("No such file or directory")
//! halfway through a run, the gateway probes for the binary up front and
//! reports a precondition failure with an install hint.
//!
//! A tool counts as available when it can be spawned at all. A non-zero exit
//! code is fine (the binary exists); only a launch failure counts as missing.

use std::process::{Command, Stdio};

pub const GCLOUD: &str = "gcloud";

pub const GCLOUD_INSTALL_HINT: &str =
    "gcloud: not found. Install: https://cloud.google.com/sdk/docs/install";

/// Attempts to spawn `cmd args...` and returns `true` if the process
/// launched (regardless of exit code).
pub fn probe(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

/// Returns install hints for every missing tool. `gcloud` names the
/// executable to look for, normally [`GCLOUD`].
pub fn missing_tools_report(gcloud: &str) -> Vec<String> {
    let mut missing = Vec::new();
    if !probe(gcloud, &["version"]) {
        missing.push(GCLOUD_INSTALL_HINT.to_string());
    }
    missing
}
