fn main() -> Result<(), Box<dyn std::error::Error>> {
    let file_descriptor_set = protox::compile(["proto/jobworker.proto"], ["proto"])?;
    tonic_build::configure().compile_fds(file_descriptor_set)?;
    Ok(())
}
