// ledeploy - resumable, idempotent application deployment

#[tokio::main]
async fn main() {
    let code = lepasserelle::cli::main().await;
    // Exit from inside the runtime so an interrupted worker thread is not awaited.
    std::process::exit(code);
}
