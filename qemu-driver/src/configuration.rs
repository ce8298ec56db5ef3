use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(serde::Deserialize, Debug, Clone)]
pub struct QmpSettings {
    pub connect_retries: u32,
    pub retry_interval_ms: u64,
    pub queue_capacity: usize,
    pub watchdog_capacity: usize,
}

impl QmpSettings {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for QmpSettings {
    fn default() -> Self {
        Self {
            connect_retries: 50,
            retry_interval_ms: 100,
            queue_capacity: 128,
            watchdog_capacity: 16,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct SupervisorSettings {
    /// How often an associated (non-child) QEMU is checked for liveness.
    pub poll_interval_ms: u64,
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct DriverSettings {
    pub qemu_executable: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub qmp: QmpSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            qemu_executable: PathBuf::from("qemu-system-x86_64"),
            log_dir: PathBuf::from("/var/log/hyper/qemu"),
            qmp: QmpSettings::default(),
            supervisor: SupervisorSettings::default(),
        }
    }
}

pub fn get_configuration() -> Result<DriverSettings, config::ConfigError> {
    // Configuration lives one level up from the crate, next to the workspace manifest
    let base_path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.."));
    get_configuration_from(&base_path.join("configuration"))
}

pub fn get_configuration_from(
    configuration_directory: &Path,
) -> Result<DriverSettings, config::ConfigError> {
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(configuration_directory.join(environment_filename)).required(false),
        )
        // Empty string means "not set"; fall back to the yaml values
        .set_override_option(
            "qemu_executable",
            std::env::var("QEMU_EXECUTABLE").ok().filter(|s| !s.is_empty()),
        )?
        .set_override_option(
            "log_dir",
            std::env::var("QEMU_LOG_DIR").ok().filter(|s| !s.is_empty()),
        )?
        .build()?;
    settings.try_deserialize::<DriverSettings>()
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parsing_is_case_insensitive() {
        assert!(matches!(
            Environment::try_from("Production".to_string()),
            Ok(Environment::Production)
        ));
        assert!(Environment::try_from("staging".to_string()).is_err());
    }

    #[test]
    fn base_file_fills_settings_and_keeps_qmp_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.yaml"),
            "qemu_executable: /opt/qemu/bin/qemu-system-x86_64\n\
             log_dir: /tmp/qemu-logs\n\
             supervisor:\n  poll_interval_ms: 250\n",
        )
        .unwrap();

        let settings = get_configuration_from(dir.path()).unwrap();
        assert_eq!(settings.log_dir, PathBuf::from("/tmp/qemu-logs"));
        assert_eq!(settings.supervisor.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.qmp.queue_capacity, 128);
        assert_eq!(settings.qmp.watchdog_capacity, 16);
    }

    #[test]
    fn missing_base_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(get_configuration_from(dir.path()).is_err());
    }
}
