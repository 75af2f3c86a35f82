//! Tracing initialisation: console sink (pretty or JSON) plus an optional
//! rotating file sink from the `[logging]` config section.
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::cli::FILE_GUARD;

pub fn init_tracing(json: bool, level: &str, file: Option<&str>, rotation: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let console_layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if json {
        Box::new(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
    } else {
        Box::new(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    };

    let registry = tracing_subscriber::registry().with(filter).with(console_layer);

    let file_layer = file.map(|path| {
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "selfcal.log".to_string());
        let appender = match rotation.unwrap_or("never") {
            "daily" => tracing_appender::rolling::daily(dir, name),
            "hourly" => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
    });

    registry.with(file_layer).init();
}
