fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Echo test service, compiled only when the `echo` feature is enabled
    // (integration tests enable it through the self dev-dependency).
    if std::env::var_os("CARGO_FEATURE_ECHO").is_some() {
        let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);
        let proto_file = "proto/echo.proto";
        println!("cargo:rerun-if-changed={proto_file}");
        tonic_build::configure()
            .build_server(true)
            .build_client(true)
            .file_descriptor_set_path(out_dir.join("echo_descriptor.bin"))
            .compile_protos(&[proto_file], &["proto"])?;
    }

    Ok(())
}
