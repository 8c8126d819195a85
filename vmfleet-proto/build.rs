//! Build script for generating Rust code from protobuf definitions.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from("src/generated");

    // Create output directory if it doesn't exist
    std::fs::create_dir_all(&out_dir)?;

    let proto = PathBuf::from("proto/vmfleet.proto");
    println!("cargo:rerun-if-changed={}", proto.display());

    // Prefer a protoc from the environment, otherwise use the bundled binary.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    // Generated messages derive serde so the HTTP gateway can emit them as JSON.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(rename_all = \"camelCase\", default)]")
        .compile(&[proto], &[PathBuf::from("proto")])?;

    Ok(())
}
