// Code generation for the BuildKit gRPC protocol

use prost::Message;
use std::path::PathBuf;

const PROTOS: &[&str] = &[
    "proto/control.proto",
    "proto/auth.proto",
    "proto/filesync.proto",
    "proto/fsutil.proto",
    "proto/health.proto",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto");

    // protox で解析するため protoc は不要
    let file_descriptors = protox::compile(PROTOS, ["proto"])?;
    let descriptor_path = PathBuf::from(std::env::var("OUT_DIR")?).join("buildkit_descriptor.bin");
    std::fs::write(&descriptor_path, file_descriptors.encode_to_vec())?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(&descriptor_path)
        .skip_protoc_run()
        .compile_protos(PROTOS, &["proto"])?;
    Ok(())
}
