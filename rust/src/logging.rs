/// tracing-subscriber::fmt → stderr, filtered by `RUST_LOG`.
///
/// Called once at the start of `ChatApp::new()`, before anything else.
/// Later calls (tests create many apps) leave the first subscriber in place.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forum_chat_core=debug,info".into()),
        )
        .try_init();
}
