use std::{io, sync::Once, thread, time::Instant};

use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

/// Log records of `level` and above from the library and the calling test to stdout, and only
/// warnings from dependencies.
///
/// Lines are prefixed with the milliseconds since setup and the logging thread, so the interleaved
/// output of several nodes can be ordered and told apart.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        let start = Instant::now();
        let test_crate = module_path!().split("::").next().unwrap_or_default();
        fern::Dispatch::new()
            .format(move |out, message, record| {
                let current = thread::current();
                let thread = match current.name() {
                    Some(name) => name.to_owned(),
                    None => format!("{:?}", current.id()),
                };
                out.finish(format_args!(
                    "{:>8}ms {:<5} {} {}: {}",
                    start.elapsed().as_millis(),
                    record.level(),
                    thread,
                    record.target(),
                    message
                ))
            })
            .level(LevelFilter::Warn)
            .level_for("shard_replication", level)
            .level_for(test_crate, level)
            .chain(io::stdout())
            .apply()
            .unwrap();
    })
}
