use clap::Parser;
use handoff_server::Args;

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    let _log_guard = handoff_server::init_tracing(args.log_dir.as_deref());

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            return std::process::ExitCode::from(1);
        }
    };

    let result = runtime.block_on(runtime.spawn(async move { handoff_server::run(args).await }));
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));

    match result {
        Ok(Ok(())) => std::process::ExitCode::SUCCESS,
        Ok(Err(err)) => {
            tracing::error!(error = %err, "handoff-server exited with error");
            std::process::ExitCode::from(err.exit_code())
        }
        Err(join_err) => {
            tracing::error!(?join_err, "handoff-server task panicked");
            std::process::ExitCode::from(1)
        }
    }
}
