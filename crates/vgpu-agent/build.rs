use std::env;

use vergen_git2::Emitter;
use vergen_git2::Git2Builder;

const DEFAULT_IMAGE_VERSION: &str = "latest";

fn main() {
    // builds outside a git checkout still get a version, just without the sha
    if let Err(err) = git_metadata() {
        println!("cargo:warning=vergen: {err}");
    }

    println!(
        "cargo:rustc-env=IMAGE_VERSION={}",
        env::var("VERSION").unwrap_or_else(|_| DEFAULT_IMAGE_VERSION.to_string())
    );
    println!("cargo:rerun-if-env-changed=VERSION");
}

fn git_metadata() -> anyhow::Result<()> {
    let git = Git2Builder::default().sha(true).dirty(true).build()?;
    Emitter::default()
        .fail_on_error()
        .add_instructions(&git)?
        .emit()
}
