fn main() -> Result<(), Box<dyn std::error::Error>> {
    // MAINTAINER NOTE:
    // This build script is disabled by default so the crate builds without
    // `protoc` installed.
    //
    // The generated Rust code is committed to `src/generated`.
    //
    // To regenerate the protobuf bindings (after updating .proto files), run:
    //     SIMDESK_GEN_PROTOS=1 cargo build
    //
    // Then commit the changes in `src/generated`.
    if std::env::var("SIMDESK_GEN_PROTOS").is_err() {
        return Ok(());
    }

    let proto_root_path = std::fs::canonicalize("proto")?;
    let proto_root = proto_root_path.to_str().ok_or("Invalid path")?.to_string();

    let proto_files = [format!("{proto_root}/simdesk/v1/exchange.proto")];

    for proto_file in &proto_files {
        println!("cargo:rerun-if-changed={}", proto_file);
    }

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .out_dir("src/generated")
        .compile_protos(&proto_files, &[proto_root])?;

    std::process::Command::new("cargo")
        .args(["fmt", "--", "src/generated/*.rs"])
        .status()
        .ok();

    Ok(())
}
