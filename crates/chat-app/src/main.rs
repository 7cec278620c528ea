use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match arbor::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "arbor exited with an error");
            eprintln!("arbor: {error}");
            ExitCode::FAILURE
        }
    }
}
