//! Build script: captures build-time information (commit, build time,
//! toolchain) and injects it via rustc-env, the way release pipelines
//! inject ldflags-style metadata.

use std::process::Command;

fn main() {
    // CI can pin these via the environment; local builds fall back to git
    // and the current time.
    let commit = std::env::var("RUNNERSET_COMMIT")
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(git_short_commit)
        .unwrap_or_else(|| "unknown".to_string());

    let build_time = std::env::var("RUNNERSET_BUILD_TIME")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());

    let rustc_version = rustc_version().unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=RUNNERSET_COMMIT={commit}");
    println!("cargo:rustc-env=RUNNERSET_BUILD_TIME={build_time}");
    println!("cargo:rustc-env=RUNNERSET_RUSTC_VERSION={rustc_version}");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=RUNNERSET_COMMIT");
    println!("cargo:rerun-if-env-changed=RUNNERSET_BUILD_TIME");
}

fn git_short_commit() -> Option<String> {
    command_stdout("git", &["rev-parse", "--short", "HEAD"])
}

fn rustc_version() -> Option<String> {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    command_stdout(&rustc, &["--version"])
}

fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8(output.stdout).ok()?;
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
