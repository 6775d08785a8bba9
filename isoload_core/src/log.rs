//! Logging utils.

use crate::envar::ISOLOAD_LOG;

use env_filter::Builder;
use jiff::Zoned;

pub const FORMATTER: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// Initialize logging to `stderr`.
///
/// It uses `ISOLOAD_LOG` environment variable to control the logging level.
/// Defaults to `error`.
pub fn init() -> Result<(), log::SetLoggerError> {
  let env_filter = Builder::from_env(ISOLOAD_LOG).build();

  fern::Dispatch::new()
    .filter(move |metadata| env_filter.enabled(metadata))
    .format(|out, message, record| {
      out.finish(format_args!(
        "[{} {} {}] {}",
        Zoned::now().strftime(FORMATTER),
        record.level(),
        record.target(),
        message
      ))
    })
    .chain(std::io::stderr())
    .apply()
}
