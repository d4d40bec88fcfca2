use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use sse::access_user::AutoType;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Reconstruction policies accepted for remote user payloads.
pub const AUTO_TYPE_POLICIES: [&str; 3] = ["disabled", "reconstruct-or-throw", "reconstruct-or-map"];

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Name this server reports in `connect-finish`.
    #[arg(long, env, default_value = "sse-server")]
    pub server_name: String,

    /// Milliseconds a push connection may stay open before it is closed by the
    /// server. 0 keeps connections open until the client leaves.
    #[arg(long, env, default_value_t = 900_000)]
    pub keepalive_ms: u64,

    /// Milliseconds clients are told to wait before reconnecting.
    #[arg(long, env, default_value_t = 5000)]
    pub reconnect_time_ms: u64,

    /// Join a cluster of peers listed in `cluster_peers`.
    #[arg(long, env, default_value_t = false)]
    pub cluster_enabled: bool,

    /// Base URLs of every node in the cluster, this one included.
    #[arg(long, env, value_delimiter = ',', use_value_delimiter = true)]
    pub cluster_peers: Vec<String>,

    /// HTTP Basic account used for peer RPC, both calling and answering.
    #[arg(long, env, default_value = "")]
    cluster_account: String,

    /// HTTP Basic password used for peer RPC.
    #[arg(long, env, default_value = "")]
    cluster_password: String,

    /// Connect timeout for peer RPC, in milliseconds
    #[arg(long, env, default_value_t = 2000)]
    pub remote_connect_timeout_ms: u64,

    /// Read timeout for peer RPC, in milliseconds
    #[arg(long, env, default_value_t = 10_000)]
    pub remote_read_timeout_ms: u64,

    /// How user payloads received from peers are reconstructed.
    #[arg(
        long,
        env,
        default_value_t = AutoType::ReconstructOrThrow,
        value_parser = clap::builder::PossibleValuesParser::new(AUTO_TYPE_POLICIES)
            .map(|s| s.parse::<AutoType>().unwrap()),
    )]
    pub connection_auto_type: AutoType,

    /// Messages held for at-least-once delivery before the oldest is dropped.
    #[arg(long, env, default_value_t = 4096)]
    pub qos_repository_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn reconnect_time(&self) -> Duration {
        Duration::from_millis(self.reconnect_time_ms)
    }

    pub fn remote_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_connect_timeout_ms)
    }

    pub fn remote_read_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_read_timeout_ms)
    }

    pub fn cluster_account(&self) -> &str {
        &self.cluster_account
    }

    pub fn cluster_password(&self) -> &str {
        &self.cluster_password
    }

    pub fn set_cluster_credentials(mut self, account: String, password: String) -> Self {
        self.cluster_account = account;
        self.cluster_password = password;
        self
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::try_parse_from(["sse_cluster_rs"]).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.keepalive(), Duration::from_secs(900));
        assert_eq!(config.reconnect_time(), Duration::from_millis(5000));
        assert_eq!(config.remote_connect_timeout(), Duration::from_millis(2000));
        assert_eq!(config.remote_read_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.connection_auto_type, AutoType::ReconstructOrThrow);
        assert_eq!(config.qos_repository_capacity, 4096);
        assert!(!config.cluster_enabled);
    }

    #[test]
    fn cluster_peers_are_comma_separated() {
        let config = Config::try_parse_from([
            "sse_cluster_rs",
            "--cluster-enabled",
            "--cluster-peers",
            "http://10.0.0.1:4000,http://10.0.0.2:4000",
            "--cluster-account",
            "node",
        ])
        .unwrap();
        assert!(config.cluster_enabled);
        assert_eq!(config.cluster_peers.len(), 2);
        assert_eq!(config.cluster_account(), "node");
    }

    #[test]
    fn auto_type_policy_parses_into_its_variant() {
        let config =
            Config::try_parse_from(["sse_cluster_rs", "--connection-auto-type", "reconstruct-or-map"]).unwrap();
        assert_eq!(config.connection_auto_type, AutoType::ReconstructOrMap);

        let parsed = Config::try_parse_from(["sse_cluster_rs", "--connection-auto-type", "trust-all"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn runtime_env_parses_case_insensitively() {
        assert_eq!("PRODUCTION".parse::<RustEnv>(), Ok(RustEnv::Production));
        assert_eq!("staging".parse::<RustEnv>(), Ok(RustEnv::Staging));
        assert!("qa".parse::<RustEnv>().is_err());
    }
}
