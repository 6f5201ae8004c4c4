fn main() {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/csi.proto"], &["proto"])
        .expect("csi protobuf compilation failed");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/filter.proto"], &["proto"])
        .expect("filter protobuf compilation failed");
}
