fn main() {
    // `VERGEN_GIT_SHA` is attached to the metrics and logs
    vergen::EmitBuilder::builder()
        .git_sha(true)
        .emit()
        .unwrap_or_else(|err| panic!("BUG: failed to emit the build info: {err:#?}"));
}
