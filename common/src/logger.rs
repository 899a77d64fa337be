use redox_log::{OutputBuilder, RedoxLogger};

pub fn output_level() -> log::LevelFilter {
    match std::env::var("USBD_LOG").ok().as_deref() {
        Some("trace") => log::LevelFilter::Trace,
        Some("debug") => log::LevelFilter::Debug,
        Some("warn") => log::LevelFilter::Warn,
        _ => log::LevelFilter::Info,
    }
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Debug
}

/// Configures logging for one component of the device stack.
///
/// Returns `false` if a logger was already installed, which happens when several tests in one
/// binary set up logging.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> bool {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    match OutputBuilder::in_redox_logging_scheme(
        category,
        subcategory,
        format!("{logfile_base}.log"),
    ) {
        Ok(b) => {
            logger = logger.with_output(b.with_filter(file_level).flush_on_newline(true).build())
        }
        Err(error) => eprintln!("Failed to create {logfile_base}.log: {}", error),
    }

    logger.enable().is_ok()
}
