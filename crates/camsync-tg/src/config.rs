use crate::{device, download, photos, tg, watcher, worker};
use serde::de::DeserializeOwned;

pub struct Config {
    pub(crate) tg: tg::Config,
    pub(crate) watch: watcher::Config,
    pub(crate) photos: photos::Config,
    pub(crate) device: device::Config,
    pub(crate) download: download::Config,
    pub(crate) worker: worker::Config,
}

impl Config {
    pub fn load_or_panic() -> Config {
        Self {
            tg: from_env_or_panic("TG_"),
            watch: from_env_or_panic("WATCH_"),
            photos: from_env_or_panic("PHOTOS_"),
            device: from_env_or_panic("DEVICE_"),
            download: from_env_or_panic("DOWNLOAD_"),
            worker: from_env_or_panic("WORKER_"),
        }
    }
}

pub(crate) fn from_env_or_panic<T: DeserializeOwned>(prefix: &str) -> T {
    envy::prefixed(prefix).from_env().unwrap_or_else(|err| {
        panic!(
            "BUG: Couldn't load config from environment for {}: {:#?}",
            std::any::type_name::<T>(),
            err
        );
    })
}
