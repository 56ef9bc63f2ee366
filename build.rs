use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=LIGHTFETCH_BUILD_VERSION");

    let version = std::env::var("LIGHTFETCH_BUILD_VERSION")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| match git_revision() {
            Some(rev) => format!("{}+{}", env!("CARGO_PKG_VERSION"), rev),
            None => env!("CARGO_PKG_VERSION").to_string(),
        });

    println!("cargo:rustc-env=LIGHTFETCH_VERSION={}", version);
}

/// Short commit hash, suffixed with `.dirty` for uncommitted changes. `None`
/// outside a git checkout, e.g. when built from a published tarball.
fn git_revision() -> Option<String> {
    let hash = git(&["rev-parse", "--short", "HEAD"])?;
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|status| !status.is_empty());

    Some(if dirty { format!("{}.dirty", hash) } else { hash })
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
