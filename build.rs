use vergen::{BuildBuilder, Emitter};

// Exposes VERGEN_BUILD_TIMESTAMP for the startup debug log.
fn main() {
    let mut emitter = Emitter::default();
    match BuildBuilder::default().build_timestamp(true).build() {
        Ok(build) => {
            if let Err(e) = emitter.add_instructions(&build) {
                eprintln!("vergen: {e}");
            }
        }
        Err(e) => eprintln!("vergen: {e}"),
    }
    if let Err(e) = emitter.emit() {
        eprintln!("vergen emit skipped: {e}");
    }
}
