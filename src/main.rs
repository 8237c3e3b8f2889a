mod app;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    app::startup::run().await
}
