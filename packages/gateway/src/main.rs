fn main() {
    if let Err(err) = exec_gateway::cli::run_gateway() {
        tracing::error!(error = %err, "exec-gateway failed");
        std::process::exit(1);
    }
}
