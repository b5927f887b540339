use log::LevelFilter;
use std::io::Write;

/// Sets the behavior of the logger, based on passed environment variables
/// such as `RUST_LOG`.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    // Shortened format
    // <time> <level> <message>
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {} {}",
            buf.timestamp_seconds(),
            record.level(),
            record.args()
        )
    });

    // Overwrite the defaults from env
    builder.parse_default_env();
    builder.init();
}
