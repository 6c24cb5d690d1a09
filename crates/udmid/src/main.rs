// # udmid - UDMI Device Daemon
//
// This is a THIN integration layer ONLY:
// - DO NOT add protocol logic, reconciliation or retry logic here
// - All device behavior lives in udmi-core
// - Configuration is via environment variables ONLY
//
// The udmid daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing tracing and the runtime
// 3. Registering transports
// 4. Running the device engine and reporting its exit reason
//
// ## Configuration
//
// ### Device
// - `UDMI_DEVICE_ID`: Device identifier (required)
// - `UDMI_PROXY_IDS`: Comma-separated proxy device ids (makes this a gateway)
// - `UDMI_OPTIONS`: Comma-separated switches: `no_proxy`, `extra_device`,
//   `smoke_check`, `fixed_log_level=<n>`, `redirect_registry=<id>`
//
// ### Endpoint
// - `UDMI_ENDPOINT_PROTOCOL`: Transport protocol (spool, memory)
// - `UDMI_ENDPOINT_HOST`: Broker host, or spool root directory
// - `UDMI_ENDPOINT_PORT`: Broker port (optional)
// - `UDMI_ENDPOINT_CLIENT_ID`: Client id (optional)
//
// ### Persistence and recording
// - `UDMI_PERSIST_PATH`: Persistent data file (in-memory when unset)
// - `UDMI_RECORD_DIR`: Directory mirroring every document (disabled when unset)
//
// ### Engine
// - `UDMI_CONFIG_WAIT_SECS`: Fail when no config arrives within this time
// - `UDMI_STATE_THROTTLE_MS`: Minimum interval between state publications
// - `UDMI_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Exit codes
//
// The engine's exit reason maps onto the supervisor convention: 0 for a
// clean shutdown, 192 for a restart and 193 for a termination. Startup
// problems exit with 1, runtime failures with 2.
//
// ## Example
//
// ```bash
// export UDMI_DEVICE_ID=GAT-123
// export UDMI_PROXY_IDS=AHU-1,AHU-22
// export UDMI_ENDPOINT_PROTOCOL=spool
// export UDMI_ENDPOINT_HOST=/var/spool/udmi
// export UDMI_PERSIST_PATH=/var/lib/udmi/persistent.json
//
// udmid
// ```

use anyhow::Result;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use udmi_core::transport::{MemoryBroker, MemoryTransportFactory};
use udmi_core::{
    Collaborators, DeviceConfig, DeviceEngine, EndpointConfiguration, EngineEvent, ExitReason,
    PersistenceConfig, ProviderRegistry, RecordingConfig,
};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for termination scenarios outside the engine's own
///
/// Lifecycle exits use the codes carried by the engine's exit reason.
#[derive(Debug, Clone, Copy)]
enum UdmiExitCode {
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<UdmiExitCode> for ExitCode {
    fn from(code: UdmiExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

#[cfg(feature = "spool")]
const DEFAULT_PROTOCOL: &str = "spool";

#[cfg(not(feature = "spool"))]
const DEFAULT_PROTOCOL: &str = "memory";

/// Application configuration
#[derive(Debug)]
struct Config {
    device_id: String,
    proxy_ids: Vec<String>,
    options: Vec<String>,
    endpoint_protocol: String,
    endpoint_host: String,
    endpoint_port: Option<u16>,
    endpoint_client_id: Option<String>,
    persist_path: Option<String>,
    record_dir: Option<String>,
    config_wait_secs: Option<u64>,
    state_throttle_ms: Option<u64>,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through a variable lookup
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| anyhow::anyhow!("{} must be a number. Got: '{}'", key, raw)),
                None => Ok(None),
            }
        };

        let endpoint_port = match number("UDMI_ENDPOINT_PORT")? {
            Some(port) => Some(u16::try_from(port).map_err(|_| {
                anyhow::anyhow!("UDMI_ENDPOINT_PORT must be between 1 and 65535. Got: {}", port)
            })?),
            None => None,
        };

        Ok(Self {
            device_id: lookup("UDMI_DEVICE_ID").unwrap_or_default(),
            proxy_ids: split_list(lookup("UDMI_PROXY_IDS")),
            options: split_list(lookup("UDMI_OPTIONS")),
            endpoint_protocol: lookup("UDMI_ENDPOINT_PROTOCOL")
                .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
            endpoint_host: lookup("UDMI_ENDPOINT_HOST").unwrap_or_default(),
            endpoint_port,
            endpoint_client_id: lookup("UDMI_ENDPOINT_CLIENT_ID"),
            persist_path: lookup("UDMI_PERSIST_PATH"),
            record_dir: lookup("UDMI_RECORD_DIR"),
            config_wait_secs: number("UDMI_CONFIG_WAIT_SECS")?,
            state_throttle_ms: number("UDMI_STATE_THROTTLE_MS")?,
            log_level: lookup("UDMI_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the daemon's own inputs
    ///
    /// The resulting `DeviceConfig` is validated again by the engine.
    fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            anyhow::bail!(
                "UDMI_DEVICE_ID is required. \
                Set it via: export UDMI_DEVICE_ID=AHU-1"
            );
        }

        match self.endpoint_protocol.as_str() {
            "memory" => {}
            #[cfg(feature = "spool")]
            "spool" => {}
            other => anyhow::bail!(
                "UDMI_ENDPOINT_PROTOCOL '{}' is not supported. \
                Supported protocols: {}",
                other,
                supported_protocols().join(", ")
            ),
        }

        if self.endpoint_host.is_empty() {
            anyhow::bail!(
                "UDMI_ENDPOINT_HOST is required. \
                For the spool transport it names the spool directory."
            );
        }

        if self.endpoint_port == Some(0) {
            anyhow::bail!("UDMI_ENDPOINT_PORT must be between 1 and 65535. Got: 0");
        }

        if let Some(ref path) = self.persist_path {
            if path.is_empty() {
                anyhow::bail!("UDMI_PERSIST_PATH cannot be empty when set");
            }
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                anyhow::bail!(
                    "UDMI_PERSIST_PATH parent directory does not exist: {}. \
                        Create it first: sudo mkdir -p {}",
                    parent.display(),
                    parent.display()
                );
            }
        }

        if self.record_dir.as_ref().is_some_and(|dir| dir.is_empty()) {
            anyhow::bail!("UDMI_RECORD_DIR cannot be empty when set");
        }

        if let Some(wait) = self.config_wait_secs
            && (!(1..=86_400).contains(&wait))
        {
            anyhow::bail!(
                "UDMI_CONFIG_WAIT_SECS must be between 1 and 86400 seconds. Got: {}",
                wait
            );
        }

        if let Some(throttle) = self.state_throttle_ms
            && throttle > 60_000
        {
            anyhow::bail!(
                "UDMI_STATE_THROTTLE_MS must be at most 60000. Got: {}",
                throttle
            );
        }

        parse_level(&self.log_level)?;
        Ok(())
    }

    /// Build the engine configuration
    fn device_config(&self) -> Result<DeviceConfig> {
        let mut endpoint = EndpointConfiguration::new(&self.endpoint_protocol, &self.endpoint_host);
        endpoint.port = self.endpoint_port;
        endpoint.client_id = self.endpoint_client_id.clone();

        let mut config = DeviceConfig::new(&self.device_id, endpoint);
        if !self.proxy_ids.is_empty() {
            config = config.with_proxies(self.proxy_ids.iter().cloned());
        }

        for option in &self.options {
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (option.as_str(), None),
            };
            match (name, value) {
                ("no_proxy", None) => config.options.no_proxy = true,
                ("extra_device", None) => config.options.extra_device = true,
                ("smoke_check", None) => config.options.smoke_check = true,
                ("fixed_log_level", Some(level)) => {
                    config.options.fixed_log_level = Some(level.parse().map_err(|_| {
                        anyhow::anyhow!("fixed_log_level must be a number. Got: '{}'", level)
                    })?);
                }
                ("redirect_registry", Some(registry)) if !registry.is_empty() => {
                    config.options.redirect_registry = Some(registry.to_string());
                }
                _ => anyhow::bail!(
                    "UDMI_OPTIONS entry '{}' is not valid. Valid options: no_proxy, \
                    extra_device, smoke_check, fixed_log_level=<n>, redirect_registry=<id>",
                    option
                ),
            }
        }

        if let Some(ref path) = self.persist_path {
            config.persistence = PersistenceConfig::File { path: path.clone() };
        }
        if let Some(ref dir) = self.record_dir {
            config.recording = RecordingConfig::File { dir: dir.clone() };
        }
        config.engine.config_wait_secs = self.config_wait_secs;
        if let Some(throttle) = self.state_throttle_ms {
            config.engine.state_throttle_ms = throttle;
        }

        config.validate()?;
        Ok(config)
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!(
            "UDMI_LOG_LEVEL '{}' is not valid. \
            Valid levels: trace, debug, info, warn, error",
            level
        ),
    }
}

fn supported_protocols() -> Vec<&'static str> {
    let mut protocols = vec!["memory"];
    #[cfg(feature = "spool")]
    protocols.push("spool");
    protocols
}

/// Process exit status for an engine exit reason
///
/// Only the low byte reaches the supervisor, so the -1 of an unknown
/// mode is reported as 255.
fn exit_status(reason: ExitReason) -> u8 {
    (reason.exit_code() & 0xff) as u8
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return UdmiExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return UdmiExitCode::ConfigError.into();
    }

    let device_config = match config.device_config() {
        Ok(device_config) => device_config,
        Err(e) => {
            eprintln!("Configuration validation error: {}", e);
            return UdmiExitCode::ConfigError.into();
        }
    };

    let log_level = parse_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return UdmiExitCode::ConfigError.into();
    }

    info!("Starting udmid daemon");
    info!(
        "Device {} on {}://{} ({} proxies)",
        device_config.device_id,
        device_config.endpoint.protocol,
        device_config.endpoint.hostname,
        config.proxy_ids.len()
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return UdmiExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(device_config))
}

/// Run the daemon
async fn run_daemon(config: DeviceConfig) -> ExitCode {
    let registry = Arc::new(ProviderRegistry::new());

    info!("Registering memory transport");
    registry.register_transport(
        "memory",
        Box::new(MemoryTransportFactory::new(MemoryBroker::new())),
    );

    #[cfg(feature = "spool")]
    {
        info!("Registering spool transport");
        udmi_transport_spool::register(&registry);
    }

    let collaborators = match Collaborators::from_config(Arc::clone(&registry), &config).await {
        Ok(collaborators) => collaborators,
        Err(e) => {
            error!("Failed to open collaborators: {}", e);
            return UdmiExitCode::ConfigError.into();
        }
    };

    let (engine, mut events) = match DeviceEngine::new(config, collaborators) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Failed to create engine: {}", e);
            return UdmiExitCode::ConfigError.into();
        }
    };

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Lifecycle { device_id, mode } => {
                    info!("Device {} transitioning to {:?}", device_id, mode)
                }
                EngineEvent::ProxyFailed { device_id, error } => {
                    warn!("Proxy {} unavailable: {}", device_id, error)
                }
                EngineEvent::EndpointRolledBack { hostname, error } => {
                    warn!("Redirect failed, back on {}: {}", hostname, error)
                }
                other => debug!("Engine event: {:?}", other),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!("Received shutdown signal: {}", signal),
            Err(e) => {
                error!("Shutdown signal handling failed: {}", e);
                return;
            }
        }
        let _ = shutdown_tx.send(());
    });

    match engine.run_with_shutdown(shutdown_rx).await {
        Ok(reason) => {
            info!("Daemon exiting: {:?}", reason);
            ExitCode::from(exit_status(reason))
        }
        Err(e) => {
            error!("Daemon error: {}", e);
            UdmiExitCode::RuntimeError.into()
        }
    }
}

/// Wait for a shutdown signal (SIGTERM, SIGINT)
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for a shutdown signal (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
