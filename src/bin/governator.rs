#[tokio::main]
async fn main() {
    match governator::gov::cli::run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
