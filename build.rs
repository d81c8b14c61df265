//! Build script to generate the C header for the integrator ABI.

use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let output_dir = PathBuf::from(&crate_dir).join("include");

    std::fs::create_dir_all(&output_dir).unwrap();

    let config = cbindgen::Config::from_file("cbindgen.toml").unwrap_or_default();

    // A header that fails to generate must not break the Rust build.
    match cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .with_language(cbindgen::Language::C)
        .generate()
    {
        Ok(bindings) => {
            bindings.write_to_file(output_dir.join("azimrs.h"));
        }
        Err(err) => {
            println!("cargo:warning=Unable to generate C bindings: {err}");
        }
    }

    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=cbindgen.toml");
}
