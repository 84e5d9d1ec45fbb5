//! Command line access to the memoized resource cache.

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            memocache_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
