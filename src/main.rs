fn main() {
    if let Err(e) = session_telemetry::run() {
        eprintln!("session-telemetry: {e}");
        std::process::exit(1);
    }
}
