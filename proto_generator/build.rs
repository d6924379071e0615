use std::path::PathBuf;

#[allow(clippy::unwrap_used)]
fn main() {
    let out_dir = PathBuf::from("../meshmetrics/src/proto");
    let proto_dir = "../proto";

    eprintln!("If you are changing protos and meshmetrics fails to build, please retry 1 time.");
    eprintln!("Cargo does not have a nice way to express a dependency order between these 2");
    eprintln!("workspace projects - because this project is _specifically_ supposed to not be a");
    eprintln!("Cargo dependency. This way users don't need protoc when compiling meshmetrics.");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(out_dir)
        .compile_protos(&[format!("{proto_dir}/forward.proto")], &[proto_dir])
        .unwrap();

    println!("cargo:rerun-if-changed=../proto");
}
