use std::{env, fs, io::BufRead, path::PathBuf};

fn git<'a, I: IntoIterator<Item = &'a str>>(args: I) -> Option<std::process::Output> {
    let output = std::process::Command::new("git").args(args).output().ok()?;
    output.status.success().then_some(output)
}

fn git_commit_hash() -> Option<String> {
    let output = git(["rev-parse", "--short", "HEAD"])?;
    output.stdout.lines().next()?.ok()
}

fn git_is_clean() -> bool {
    git(["status", "--porcelain"]).is_some_and(|output| output.stdout.is_empty())
}

fn main() {
    println!("cargo:rerun-if-env-changed=APIBARA_DEPLOY_RELEASE");

    let doing_release = option_env!("APIBARA_DEPLOY_RELEASE")
        .map(|env| matches!(env, "1" | "true"))
        .unwrap_or_default();

    let mut version = env!("CARGO_PKG_VERSION").to_owned();
    // Builds from a source archive have no git metadata, in which case the plain version is used.
    if !doing_release {
        if let Some(commit_hash) = git_commit_hash() {
            version.push('+');
            version.push_str(&commit_hash);
            if !git_is_clean() {
                version.push_str(".dirty");
            }
        }
    }

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
    fs::write(
        out_dir.join("version.rs"),
        format!("pub const VERSION: &str = {version:?};"),
    )
    .unwrap();
}
