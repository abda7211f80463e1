use tracing::debug;

/// Spawns a thread with the given name.
///
/// # Panics
/// Panics if the OS refuses to spawn a thread.
pub fn spawn_named<F, T>(name: &str, f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    debug!(name, "spawning thread");
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("couldn't spawn a thread")
}
