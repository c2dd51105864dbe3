use vergen_gix::{BuildBuilder, CargoBuilder, Emitter, GixBuilder};

// Emits exactly the VERGEN_* env vars that main.rs's long_version()
// consumes: VERGEN_GIT_SHA, VERGEN_BUILD_TIMESTAMP, and
// VERGEN_CARGO_TARGET_TRIPLE. vergen-gix substitutes placeholders when a
// value is unavailable (e.g. building outside a git checkout), so env!()
// at the use site never fails.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    Emitter::default()
        .add_instructions(&GixBuilder::default().sha(true).build()?)?
        .add_instructions(&BuildBuilder::default().build_timestamp(true).build()?)?
        .add_instructions(&CargoBuilder::default().target_triple(true).build()?)?
        .emit()?;
    Ok(())
}
