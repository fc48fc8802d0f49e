pub(crate) const KB: u64 = 1024;
pub(crate) const MB: u64 = 1024 * KB;
