use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryProtocol {
    Grpc,
    HttpProtobuf,
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub protocol: TelemetryProtocol,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub default_filter: String,
    pub json_logs: bool,
    pub enabled: bool,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        Self::from_lookup(default_service_name, default_service_version, |key| {
            env::var(key).ok()
        })
    }

    /// Builds the config from an arbitrary key lookup so tests need not touch
    /// the process environment.
    pub fn from_lookup<F>(default_service_name: &str, default_service_version: &str, get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = get("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_default();
        let protocol = match get("OTEL_EXPORTER_OTLP_PROTOCOL")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            Some("http") | Some("http/protobuf") => TelemetryProtocol::HttpProtobuf,
            _ => TelemetryProtocol::Grpc,
        };
        let service_name =
            get("OTEL_SERVICE_NAME").unwrap_or_else(|| default_service_name.to_string());
        let service_version =
            get("OTEL_SERVICE_VERSION").unwrap_or_else(|| default_service_version.to_string());
        let environment = get("DEPLOYMENT_ENV").unwrap_or_else(|| "dev".into());
        let default_filter = get("HOOKGRAM_LOG").unwrap_or_else(|| "info".into());
        let json_logs = get("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        let enabled_flag = get("ENABLE_OTEL")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            enabled: enabled_flag && !endpoint.trim().is_empty(),
            endpoint,
            protocol,
            service_name,
            service_version,
            environment,
            default_filter,
            json_logs,
        }
    }

    pub fn exporter_enabled(&self) -> bool {
        self.enabled && !self.endpoint.trim().is_empty()
    }
}
