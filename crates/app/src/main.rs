fn main() {
    if let Err(error) = hiresfix_app::run_from_env() {
        tracing::error!("{error:#}");
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}
