use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use tlstap_common::{
    FilterConfig, HeaderLenMode, POLICY_CARD_NUMBER, POLICY_HTTP_CLOUD_HOST, TaskOffsets,
};

const DEFAULT_STATS_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_PROC_ROOT: &str = "/proc";

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct ProbeToggles {
    pub openssl: Option<bool>,
    pub gotls: Option<bool>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct FilterSettings {
    pub http_cloud_host: Option<bool>,
    pub card_number: Option<bool>,
    /// `masked` or `clamped`
    pub header_length_mode: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TargetSettings {
    pub pids: Option<Vec<u32>>,
    pub libssl_paths: Option<Vec<String>>,
    pub go_binaries: Option<Vec<String>>,
    /// Host procfs mount, e.g. `/host/proc` when running in a container.
    pub proc_root: Option<String>,
}

/// Kernel struct offsets; see `TaskOffsets`.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct KernelSettings {
    pub task_group_leader_offset: Option<u32>,
    pub task_nsproxy_offset: Option<u32>,
    pub nsproxy_pid_ns_offset: Option<u32>,
    pub ns_inum_offset: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct OutputSettings {
    /// `log` or `json`
    pub format: Option<String>,
    pub stats_interval: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Log,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub probes: ProbeToggles,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub targets: TargetSettings,
    #[serde(default)]
    pub kernel: KernelSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("targets.pids")
                    .with_list_parse_key("targets.libssl_paths")
                    .with_list_parse_key("targets.go_binaries")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn openssl_enabled(&self) -> bool {
        self.probes.openssl.unwrap_or(true)
    }

    pub fn gotls_enabled(&self) -> bool {
        self.probes.gotls.unwrap_or(true)
    }

    pub fn to_filter_config(&self) -> Result<FilterConfig, ConfigError> {
        let mut policies = 0;
        if self.filter.http_cloud_host.unwrap_or(true) {
            policies |= POLICY_HTTP_CLOUD_HOST;
        }
        if self.filter.card_number.unwrap_or(false) {
            policies |= POLICY_CARD_NUMBER;
        }

        let mode = match self.filter.header_length_mode.as_deref() {
            None => HeaderLenMode::Masked,
            Some(m) if m.eq_ignore_ascii_case("masked") => HeaderLenMode::Masked,
            Some(m) if m.eq_ignore_ascii_case("clamped") => HeaderLenMode::Clamped,
            Some(other) => {
                return Err(ConfigError::Message(format!(
                    "filter.header_length_mode must be 'masked' or 'clamped', got '{}'",
                    other
                )));
            }
        };

        Ok(FilterConfig::new(policies, mode))
    }

    pub fn to_task_offsets(&self) -> TaskOffsets {
        let defaults = TaskOffsets::default();
        TaskOffsets {
            group_leader: self
                .kernel
                .task_group_leader_offset
                .unwrap_or(defaults.group_leader),
            nsproxy: self.kernel.task_nsproxy_offset.unwrap_or(defaults.nsproxy),
            pid_ns_for_children: self
                .kernel
                .nsproxy_pid_ns_offset
                .unwrap_or(defaults.pid_ns_for_children),
            ns_inum: self.kernel.ns_inum_offset.unwrap_or(defaults.ns_inum),
        }
    }

    pub fn output_format(&self) -> Result<OutputFormat, ConfigError> {
        match self.output.format.as_deref() {
            None => Ok(OutputFormat::Log),
            Some(f) if f.eq_ignore_ascii_case("log") => Ok(OutputFormat::Log),
            Some(f) if f.eq_ignore_ascii_case("json") => Ok(OutputFormat::Json),
            Some(other) => Err(ConfigError::Message(format!(
                "output.format must be 'log' or 'json', got '{}'",
                other
            ))),
        }
    }

    pub fn stats_interval_secs(&self) -> u64 {
        self.output
            .stats_interval
            .unwrap_or(DEFAULT_STATS_INTERVAL_SECONDS)
    }

    pub fn proc_root(&self) -> &str {
        self.targets.proc_root.as_deref().unwrap_or(DEFAULT_PROC_ROOT)
    }

    pub fn target_pids(&self) -> Vec<u32> {
        self.targets.pids.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("PROBES__GOTLS", "false");
            std::env::set_var("FILTER__CARD_NUMBER", "true");
            std::env::set_var("FILTER__HEADER_LENGTH_MODE", "clamped");
            std::env::set_var("TARGETS__PIDS", "10,20");
            std::env::set_var("OUTPUT__STATS_INTERVAL", "5");
        }

        let settings = Settings::new().expect("Failed to load settings");

        assert_eq!(settings.probes.gotls, Some(false));
        assert!(settings.openssl_enabled());
        assert!(!settings.gotls_enabled());
        assert_eq!(settings.target_pids(), vec![10, 20]);
        assert_eq!(settings.stats_interval_secs(), 5);

        let filter = settings.to_filter_config().unwrap();
        assert!(filter.has(POLICY_HTTP_CLOUD_HOST));
        assert!(filter.has(POLICY_CARD_NUMBER));
        assert_eq!(filter.header_len_mode(), HeaderLenMode::Clamped);

        unsafe {
            std::env::remove_var("PROBES__GOTLS");
            std::env::remove_var("FILTER__CARD_NUMBER");
            std::env::remove_var("FILTER__HEADER_LENGTH_MODE");
            std::env::remove_var("TARGETS__PIDS");
            std::env::remove_var("OUTPUT__STATS_INTERVAL");
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.openssl_enabled());
        assert!(settings.gotls_enabled());
        assert_eq!(settings.to_filter_config().unwrap(), FilterConfig::default());
        assert_eq!(settings.to_task_offsets(), TaskOffsets::default());
        assert_eq!(settings.output_format().unwrap(), OutputFormat::Log);
        assert_eq!(settings.proc_root(), "/proc");
        assert!(settings.target_pids().is_empty());
    }

    #[test]
    fn test_filter_can_be_disabled_entirely() {
        let settings = Settings {
            filter: FilterSettings {
                http_cloud_host: Some(false),
                card_number: Some(false),
                header_length_mode: None,
            },
            ..Default::default()
        };
        assert_eq!(settings.to_filter_config().unwrap().policies, 0);
    }

    #[test]
    fn test_rejects_unknown_modes() {
        let settings = Settings {
            filter: FilterSettings {
                header_length_mode: Some("wrapped".into()),
                ..Default::default()
            },
            output: OutputSettings {
                format: Some("xml".into()),
                stats_interval: None,
            },
            ..Default::default()
        };
        assert!(settings.to_filter_config().is_err());
        assert!(settings.output_format().is_err());
    }

    #[test]
    fn test_kernel_offsets_override_defaults() {
        let settings = Settings {
            kernel: KernelSettings {
                task_group_leader_offset: Some(0x100),
                ns_inum_offset: Some(0x10),
                ..Default::default()
            },
            ..Default::default()
        };
        let offsets = settings.to_task_offsets();
        assert_eq!(offsets.group_leader, 0x100);
        assert_eq!(offsets.ns_inum, 0x10);
        assert_eq!(offsets.nsproxy, TaskOffsets::default().nsproxy);
    }
}
