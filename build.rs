use chrono::Utc;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const DEFAULT_ENVELOPE_VERSION: i64 = 1;

fn main() {
    let manifest = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap()).join("Cargo.toml");
    let out = PathBuf::from(env::var_os("OUT_DIR").unwrap()).join("version.rs");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-changed=.git/HEAD");

    if is_fresh(&out, &manifest) {
        return;
    }

    let generated = format!(
        "pub const ENVELOPE_VERSION: u32 = {};\n\
         pub const BUILD_TIME: &str = \"{}\";\n\
         pub const GIT_HASH: &str = \"{}\";\n",
        envelope_version(&manifest),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        git_short_hash().unwrap_or_else(|| "unknown".to_string()),
    );
    fs::write(&out, generated).unwrap();
}

/// Generated file is newer than the manifest
fn is_fresh(out: &Path, manifest: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(out), modified(manifest)) {
        (Some(generated), Some(source)) => generated >= source,
        _ => false,
    }
}

/// `[package.metadata] envelope_version`
fn envelope_version(manifest: &Path) -> i64 {
    fs::read_to_string(manifest)
        .ok()
        .and_then(|content| content.parse::<toml::Table>().ok())
        .and_then(|table| {
            table
                .get("package")?
                .get("metadata")?
                .get("envelope_version")?
                .as_integer()
        })
        .filter(|v| *v > 0 && *v <= u32::MAX as i64)
        .unwrap_or(DEFAULT_ENVELOPE_VERSION)
}

fn git_short_hash() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
