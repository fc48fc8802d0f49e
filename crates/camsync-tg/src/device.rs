//! Control over the companion app that uploads the camera folder to the
//! catalog. The app only syncs while it is in the foreground, so the worker
//! opens it for every file and stops it afterwards.

use crate::prelude::*;
use crate::util::process;
use crate::{err, Result};
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub(crate) trait CompanionApp: Send + Sync {
    async fn open(&self) -> Result;
    async fn force_stop(&self) -> Result;
}

#[derive(Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_photos_package")]
    pub(crate) photos_package: String,
}

fn default_photos_package() -> String {
    "com.google.android.apps.photos".to_owned()
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum DeviceError {
    #[error("Failed to open the app `{package}`")]
    Open {
        package: String,
        source: crate::Error,
    },

    #[error("Failed to force-stop the app `{package}`")]
    ForceStop {
        package: String,
        source: crate::Error,
    },
}

/// Runs on the Android device itself, so it uses the activity manager
/// directly rather than through `adb`.
pub(crate) struct AndroidPhotosApp {
    package: String,
}

impl AndroidPhotosApp {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            package: config.photos_package,
        }
    }
}

#[async_trait]
impl CompanionApp for AndroidPhotosApp {
    #[instrument(skip(self), fields(package = %self.package))]
    async fn open(&self) -> Result {
        let package = &self.package;
        let activity = format!("{package}/.home.HomeActivity");

        let Err(err) = process::run("am", &["start", "-n", &activity]).await else {
            info!("Opened the app");
            return Ok(());
        };

        warn!(
            err = tracing_err(&err),
            "Couldn't start the home activity, falling back to the launcher intent"
        );

        let launcher = [
            "start",
            "-a",
            "android.intent.action.MAIN",
            "-c",
            "android.intent.category.LAUNCHER",
            package.as_str(),
        ];

        process::run("am", &launcher)
            .await
            .map_err(|source| err!(DeviceError::Open { package, source }))?;

        info!("Opened the app via the launcher intent");

        Ok(())
    }

    #[instrument(skip(self), fields(package = %self.package))]
    async fn force_stop(&self) -> Result {
        let package = &self.package;
        let cmd = format!("am force-stop {package}");

        process::run("su", &["-c", &cmd])
            .await
            .map_err(|source| err!(DeviceError::ForceStop { package, source }))?;

        info!("Force-stopped the app");

        Ok(())
    }
}
