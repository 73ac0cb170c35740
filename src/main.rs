use strata::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::from_args();
    if let Err(e) = strata::run(config).await {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}
