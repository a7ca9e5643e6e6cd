use std::{fs, io};

const PROTO_DIR: &str = "./protos/";
const GENERATED_DIR: &str = "./generated/";

// `src/lib.rs` includes the generated module from `generated/`.
fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=protos/scorebook.proto");
    fs::create_dir_all(GENERATED_DIR)?;
    tonic_build::configure()
        .out_dir(GENERATED_DIR)
        .compile(&["./protos/scorebook.proto"], &[PROTO_DIR])
}
