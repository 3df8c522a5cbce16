use std::io::Write;
use std::str::FromStr;

use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;

/// Installs the global logger. `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) {
    let default_level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, default_level);

    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    // A second init (tests, embedding) keeps the first logger.
    if builder.try_init().is_ok() {
        log::debug!("Logger initialized at {}.", default_level);
    }
}
