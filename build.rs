fn main() {
    if !cfg!(target_os = "linux") {
        panic!(
            "{} relies on linux specific process control (prctl, pipe2)",
            env!("CARGO_PKG_NAME")
        );
    }
}
