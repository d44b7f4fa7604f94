// build.rs - Vesper kernel build script: bare-metal link flags and build metadata

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=Cargo.toml");

    // Static link flags only apply to the bare-metal target; host builds
    // (the logic test suite) link normally.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        configure_kernel_target();
    }

    embed_kernel_build_info();
}

fn configure_kernel_target() {
    println!("cargo:rustc-link-arg=-nostdlib");
    println!("cargo:rustc-link-arg=-static");
    println!("cargo:rustc-link-arg=--gc-sections");
    println!("cargo:rustc-link-arg=-z");
    println!("cargo:rustc-link-arg=max-page-size=0x1000");
}

fn embed_kernel_build_info() {
    let build_time = Command::new("date")
        .arg("+%Y-%m-%d %H:%M:%S UTC")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    println!("cargo:rustc-env=VESPER_BUILD_TIME={}", build_time);

    if let Ok(output) = Command::new("git").args(["rev-parse", "--short", "HEAD"]).output() {
        let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
        println!("cargo:rustc-env=VESPER_GIT_COMMIT={}", commit);
    } else {
        println!("cargo:rustc-env=VESPER_GIT_COMMIT=unknown");
    }

    println!("cargo:rustc-env=VESPER_KERNEL_NAME=Vesper Kernel");
    println!("cargo:rustc-env=VESPER_KERNEL_VERSION=0.1.0");
}
