fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Wire types are hand-written in src/wire.rs rather than generated from
    // .proto files. To switch to proto-driven generation, uncomment below:
    //
    // prost_build::compile_protos(
    //     &["../../proto/clustervote/wire.proto"],
    //     &["../../proto"],
    // )?;

    Ok(())
}
