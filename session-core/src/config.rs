//! session-guard process configs

pub mod cli {
    //! Parse from either cli or env var

    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "session-guard-worker";
    /// where the device id is persisted between runs
    pub static DEFAULT_DEVICE_ID_PATH: &str = "/var/lib/session-guard/device-id";
    /// default log level. Can use this argument or SESSION_LOG env var
    pub const DEFAULT_SESSION_LOG: &str = "info";

    use std::path::PathBuf;

    pub use clap::Parser;
    use clap::Subcommand;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "session-guard", bin_name = "session-guard", about, long_about = None)]
    /// parses from cli & environment var. session-guard will load `.env` in the working dir as well
    pub struct Config {
        /// path to the lease config (yaml or json). Built-in defaults when unset
        #[clap(short, long, value_parser, env)]
        pub config_path: Option<PathBuf>,
        /// file holding this device's id, created on first run
        #[clap(long, env, value_parser, default_value = DEFAULT_DEVICE_ID_PATH)]
        pub device_id_path: PathBuf,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_SESSION_LOG)]
        pub session_log: String,
        #[clap(subcommand)]
        pub command: Command,
    }

    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// sign in and hold the account's session until ctrl-c or eviction
        Hold {
            /// account to hold
            #[clap(long, value_parser)]
            account: String,
        },
        /// print the account's current lease record as JSON
        Inspect {
            /// account to look up
            #[clap(long, value_parser)]
            account: String,
        },
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_hold() {
            let config =
                Config::try_parse_from(["session-guard", "--threads", "2", "hold", "--account", "alice"])
                    .unwrap();
            assert_eq!(config.threads, Some(2));
            assert_eq!(config.session_log, DEFAULT_SESSION_LOG);
            assert_eq!(
                config.command,
                Command::Hold {
                    account: "alice".into()
                }
            );
        }

        #[test]
        fn test_subcommand_required() {
            assert!(Config::try_parse_from(["session-guard"]).is_err());
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for logging
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Log level comes from SESSION_LOG
        pub fn parse(session_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(session_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("async_nats=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
