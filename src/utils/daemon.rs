//! Detach the broker from its controlling terminal.

use daemonize::Daemonize;

/// Double fork into a new session with `/` as working directory and stdio
/// pointed at `/dev/null`. The parent processes exit immediately.
///
/// Must be called before any threads (including the tokio runtime) exist.
pub fn daemonize() -> std::io::Result<()> {
    Daemonize::new()
        .working_directory("/")
        .umask(0o022)
        .start()
        .map_err(std::io::Error::other)
}
