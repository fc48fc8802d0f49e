mod formatting;
mod future_ext;
mod init;

pub use formatting::tracing_err;
pub use init::{init_logging, LoggingTask};

pub(crate) mod prelude {
    pub(crate) use super::formatting::{tracing_duration, tracing_err};
    pub(crate) use super::future_ext::FutureExt as _;

    // The whole family of macros, so that call sites never import them
    #[allow(unused_imports)]
    pub(crate) use tracing::{
        debug, debug_span, error, error_span, info, info_span, instrument, trace, trace_span, warn,
        warn_span, Instrument as _,
    };
}
