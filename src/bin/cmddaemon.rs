fn main() -> anyhow::Result<()> {
    // Daemonization forks before the runtime exists, so the entry point
    // stays synchronous; the tokio runtime is built after detaching.
    cmddaemon::daemon::main()
}
