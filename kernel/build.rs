use std::{
    env,
    path::{Path, PathBuf},
    process::Command,
};

fn main() {
    let target = env::var("TARGET").expect("TARGET not set");
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));

    println!("cargo:rustc-env=GIT_HASH={}", git_hash());
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_timestamp());

    if target.contains("x86_64") {
        embed_init_binary(&target, &out_dir);
    }
}

fn git_hash() -> String {
    Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "0".repeat(40))
}

fn build_timestamp() -> String {
    Command::new("date")
        .args(["+%s"])
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "0".to_string())
}

/// Cross-compiles `userland/bin/hello` for this same target and copies the
/// resulting static ELF to `$OUT_DIR/init.elf`, where `bootstrap::kernel_main`
/// embeds it with `include_bytes!` as the first environment's image. This is
/// the exokernel equivalent of a filesystem-backed init program: with no
/// filesystem, the one binary the kernel always knows how to run has to be
/// baked into the kernel image itself.
///
/// Uses a target directory under `OUT_DIR` rather than the workspace's own
/// `target/`, so this nested `cargo build` doesn't contend for the same
/// build-directory lock the outer build already holds.
fn embed_init_binary(target: &str, out_dir: &Path) {
    let workspace_root = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"))
        .parent()
        .expect("kernel/ has a parent directory")
        .to_path_buf();
    let userland_target_dir = out_dir.join("userland-target");

    println!(
        "cargo:rerun-if-changed={}",
        workspace_root.join("userland/bin/hello/src").display()
    );
    println!(
        "cargo:rerun-if-changed={}",
        workspace_root.join("userland/libs/libveridian/src").display()
    );

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(&cargo)
        .args(["build", "--release", "--package", "hello", "--target", target])
        .arg("--target-dir")
        .arg(&userland_target_dir)
        .current_dir(&workspace_root)
        .status()
        .expect("failed to spawn cargo to cross-compile the init binary");
    assert!(status.success(), "cross-compiling userland/bin/hello for {target} failed");

    let built = userland_target_dir.join(target).join("release").join("hello");
    std::fs::copy(&built, out_dir.join("init.elf"))
        .unwrap_or_else(|e| panic!("failed to copy {}: {e}", built.display()));
}
