use keystash::cli::run_cli;

fn install_rustls_provider() {
    use rustls::crypto::{ring, CryptoProvider};

    // A provider installed concurrently is just as good as ours.
    if CryptoProvider::get_default().is_none() {
        let _ = ring::default_provider().install_default();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_rustls_provider();

    // Must run before configuration reads the environment.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    run_cli().await
}
