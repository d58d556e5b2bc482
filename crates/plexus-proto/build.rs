// ABOUTME: Build script for generating Rust code from plexus.proto.
// ABOUTME: Uses tonic-build to compile protobuf definitions into Rust types.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto-src/plexus.proto"], &["proto-src"])?;

    // Rerun if the proto file changes
    println!("cargo:rerun-if-changed=proto-src/plexus.proto");

    Ok(())
}
