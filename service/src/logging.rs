use crate::config::Config;
use log::LevelFilter;
use simplelog::{self, ConfigBuilder};

/// Connection plumbing underneath the push streams and peer RPC. Only shown at
/// Trace.
const TRANSPORT_MODULES: &[&str] = &["hyper", "h2", "mio", "tower", "tower_http"];

/// HTTP server and peer client crates. Shown from Debug, where a peer call
/// failing is worth following down to the request.
const CLIENT_MODULES: &[&str] = &["axum", "reqwest"];

pub struct Logger {}

impl Logger {
    /// Installs the global terminal logger at `config.log_level_filter`.
    ///
    /// Fails if a global logger is already installed.
    pub fn init_logger(config: &Config) -> Result<(), log::SetLoggerError> {
        simplelog::TermLogger::init(
            Self::convert_level_filter(config.log_level_filter),
            Self::build_log_config(config.log_level_filter),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
    }

    fn convert_level_filter(level: LevelFilter) -> simplelog::LevelFilter {
        match level {
            LevelFilter::Off => simplelog::LevelFilter::Off,
            LevelFilter::Error => simplelog::LevelFilter::Error,
            LevelFilter::Warn => simplelog::LevelFilter::Warn,
            LevelFilter::Info => simplelog::LevelFilter::Info,
            LevelFilter::Debug => simplelog::LevelFilter::Debug,
            LevelFilter::Trace => simplelog::LevelFilter::Trace,
        }
    }

    /// Dependency modules silenced at `level`.
    fn ignored_modules(level: LevelFilter) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if level < LevelFilter::Trace {
            ignored.extend_from_slice(TRANSPORT_MODULES);
        }
        if level < LevelFilter::Debug {
            ignored.extend_from_slice(CLIENT_MODULES);
        }
        ignored
    }

    /// RFC3339 timestamps, with the module path on every line from Debug so
    /// registry, cluster and delivery output can be told apart.
    fn build_log_config(level: LevelFilter) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();
        if level >= LevelFilter::Debug {
            builder.set_target_level(simplelog::LevelFilter::Error);
        }
        for module in Self::ignored_modules(level) {
            builder.add_filter_ignore_str(module);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_shows_every_dependency() {
        assert!(Logger::ignored_modules(LevelFilter::Trace).is_empty());
    }

    #[test]
    fn debug_keeps_peer_client_logs_but_hides_transport() {
        let ignored = Logger::ignored_modules(LevelFilter::Debug);
        assert!(ignored.contains(&"hyper"));
        assert!(ignored.contains(&"tower_http"));
        assert!(!ignored.contains(&"reqwest"));
        assert!(!ignored.contains(&"axum"));
    }

    #[test]
    fn info_and_below_hide_all_dependencies() {
        for level in [LevelFilter::Off, LevelFilter::Error, LevelFilter::Warn, LevelFilter::Info] {
            let ignored = Logger::ignored_modules(level);
            for module in TRANSPORT_MODULES.iter().chain(CLIENT_MODULES) {
                assert!(ignored.contains(module), "{module} should be hidden at {level}");
            }
        }
    }

    #[test]
    fn push_crates_are_never_hidden() {
        for level in [LevelFilter::Error, LevelFilter::Info, LevelFilter::Debug] {
            let ignored = Logger::ignored_modules(level);
            assert!(!ignored.contains(&"sse"));
            assert!(!ignored.contains(&"web"));
        }
    }

    #[test]
    fn build_log_config_accepts_every_level() {
        for level in [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ] {
            let _config = Logger::build_log_config(level);
        }
    }

    #[test]
    fn convert_level_filter_keeps_the_level() {
        assert_eq!(
            Logger::convert_level_filter(LevelFilter::Warn) as u8,
            simplelog::LevelFilter::Warn as u8
        );
        assert_eq!(
            Logger::convert_level_filter(LevelFilter::Trace) as u8,
            simplelog::LevelFilter::Trace as u8
        );
    }
}
