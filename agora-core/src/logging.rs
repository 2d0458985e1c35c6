/// Logger setup for host applications.
///
/// Library code only uses the `log` facade. Call `init_logging` once at
/// startup; repeated calls are harmless.

#[cfg(not(feature = "android"))]
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    if env_logger::Builder::from_env(env).try_init().is_ok() {
        log::debug!("env_logger initialized");
    }
}

#[cfg(feature = "android")]
pub fn init_logging() {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Debug)
            .with_tag("AgoraCore"),
    );
}
