//! Linker scripts for the firmware binary. `memory.x` itself comes from
//! embassy-stm32's `memory-x` feature; host builds of the library need nothing.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let firmware = env::var_os("CARGO_FEATURE_FIRMWARE").is_some();
    let target = env::var("TARGET").unwrap_or_default();

    if firmware && target.starts_with("thumb") {
        println!("cargo:rustc-link-arg-bins=--nmagic");
        println!("cargo:rustc-link-arg-bins=-Tlink.x");
        println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
    }
}
