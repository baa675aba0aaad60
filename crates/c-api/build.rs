use std::{env, path::PathBuf};

fn main() {
    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");

    let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let bindings = cbindgen::generate(&crate_dir).unwrap();
    bindings.write_to_file(crate_dir.join("include").join("jsenv.h"));
}
