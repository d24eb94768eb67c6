use std::any::Any;

use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

pub(crate) fn style_root() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Spinner for a single running task, without progress.
pub(crate) fn style_task() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_spinner()
        .template("  {spinner:.blue} [{elapsed}] {msg}")?
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "))
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("action panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("action panicked: {s}")
    } else {
        String::from("action panicked with unknown payload")
    }
}

/// Installs a global subscriber printing log lines above the progress bars.
///
/// The filter is read from `NAGARE_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_env("NAGARE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}
