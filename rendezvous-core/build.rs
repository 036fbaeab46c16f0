fn main() {
    let proto_file = "../proto/coordinator.proto";
    let proto_dir = "../proto";

    // Rerun if proto file changes
    println!("cargo:rerun-if-changed={}", proto_file);

    // Use the vendored protoc so builds don't depend on a system install
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc not found");
    std::env::set_var("PROTOC", protoc);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_file], &[proto_dir])
        .expect("Failed to compile coordinator.proto");
}
