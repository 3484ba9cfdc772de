fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path().unwrap(),
    );
    // Compile the vendored protos with tonic-build. The proxy both serves
    // and consumes the CAS/ByteStream surface, so generate both sides.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // Make Digest hashable for use in HashMaps
        .type_attribute(
            "build.bazel.remote.execution.v2.Digest",
            "#[derive(Eq, Hash)]",
        )
        .compile_protos(
            &[
                "proto/build/bazel/remote/execution/v2/remote_execution.proto",
                "proto/google/bytestream/bytestream.proto",
                "proto/sidecas/atime.proto",
                "proto/sidecas/hit_tracker.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
