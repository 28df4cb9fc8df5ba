use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    portmap_lib::run().await
}
