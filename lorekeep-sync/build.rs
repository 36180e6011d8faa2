//! Build script for lorekeep-sync
//!
//! Compiles the game service protocol into the tonic client used by
//! `GrpcEventLogClient`.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        // We only consume the game service
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/game.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/game.proto");

    Ok(())
}
