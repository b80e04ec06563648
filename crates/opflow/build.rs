use std::process::Command;

use chrono::Utc;

const TAG_PREFIX: &str = "opflow@v";

fn main() {
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/refs/");

    let version = env!("CARGO_PKG_VERSION");
    let stamp = match describe() {
        Some(described) if described == format!("{TAG_PREFIX}{version}") => version.to_owned(),
        Some(described) => {
            let commit = described
                .rsplit('-')
                .next()
                .unwrap_or("unknown")
                .trim_start_matches('g');
            format!("{version}+{commit}.{}", Utc::now().format("%Y%m%d"))
        }
        None => format!("{version}+unknown"),
    };

    println!("cargo:rustc-env=OPFLOW_VERSION={stamp}");
}

/// `git describe` against release tags; a bare commit hash when none match.
fn describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--abbrev=9"])
        .arg(format!("--match={TAG_PREFIX}*"))
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let described = String::from_utf8(output.stdout).ok()?;
    Some(described.trim().to_owned())
}
