use std::io::{Error, ErrorKind, Result};
use std::path::PathBuf;

const PROTOS: &[&str] = &[
    "proto/greeter.proto",
    "proto/playground.proto",
    "proto/com/foo/users.proto",
    "proto/com/bar/users.proto",
    "proto/org/other/users.proto",
];

fn main() -> Result<()> {
    let out_dir = std::env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "OUT_DIR is not set"))?;

    // Proto3 `optional` fields exercise presence tracking in the codec tests.
    tonic_prost_build::configure()
        .file_descriptor_set_path(out_dir.join("descriptors.bin"))
        .protoc_arg("--experimental_allow_proto3_optional")
        .build_client(false)
        .compile_protos(PROTOS, &["proto"])?;

    Ok(())
}
