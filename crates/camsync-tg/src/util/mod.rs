//! Small extensions of std and third-party types shared by the modules
mod std_ext;
mod teloxide_ext;

pub(crate) mod display;
pub(crate) mod process;
pub(crate) mod units;

pub(crate) use teloxide_ext::{code_block_truncated, escape_truncated};

#[cfg(test)]
pub(crate) mod test_server;

pub(crate) mod prelude {
    pub(crate) use super::std_ext::prelude::*;
    pub(crate) use super::teloxide_ext::prelude::*;
}

pub(crate) type DynResult<T = (), E = Box<DynError>> = std::result::Result<T, E>;
pub(crate) type DynError = dyn std::error::Error + Send + Sync;
