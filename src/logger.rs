//! Logging initializer.
//!
//! This crate has no CLI or packaging surface, so unlike the wider
//! application this persistence core was lifted from, there's no
//! `{db_name}_logs` rolling file setup to wire up. A single stderr appender
//! at `Info` is enough for a library whose caller decides its own log sink.
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Initialize a minimal stderr logger. Safe to call more than once; only the
/// first call wins (`log4rs::init_config` errors on repeat init are ignored).
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let encoder = Box::new(PatternEncoder::new("{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
    let stderr = ConsoleAppender::builder().encoder(encoder).build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(LevelFilter::Info))?;
    let _ = log4rs::init_config(config);
    Ok(())
}
