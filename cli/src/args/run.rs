//! Arguments for running QoS cycles.

use std::time::Duration;

use clap::Args;
use qos_client::{ClientConfig, DEFAULT_LISTEN_PORT};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Host name or address of the coordinator.
    #[clap(short = 'c', long = "coordinator")]
    pub coordinator: String,
    /// Port the coordinator listens on.
    #[clap(short = 'p', long = "port", default_value = "443")]
    pub port: u16,
    /// The test profile to request.
    #[clap(long = "profile", default_value = "default")]
    pub profile: String,
    /// Talk to the coordinator over cleartext HTTP/2 instead of TLS.
    #[clap(long = "http")]
    pub http: bool,
    /// Accept coordinator certificates that do not verify.
    #[clap(long = "insecure")]
    pub insecure: bool,
    /// UDP port to receive probe replies on. Falls back to an ephemeral port
    /// when it is taken.
    #[clap(long = "listen-port", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,
    /// How often the client is advanced, in milliseconds.
    #[clap(long = "update-interval-ms", default_value = "10")]
    pub update_interval_ms: u64,
    /// Number of cycles to run before exiting.
    #[clap(long = "cycles", default_value = "1")]
    pub cycles: usize,
    /// Longest a single cycle may take, in milliseconds.
    #[clap(long = "max-time-ms", default_value = "60000")]
    pub max_time_ms: u64,
}

impl RunArgs {
    pub fn client_config(&self, verbosity: i32) -> ClientConfig {
        ClientConfig {
            listen_port: self.listen_port,
            max_process_time: Duration::from_millis(self.max_time_ms),
            verbosity,
            ignore_cert_errors: self.insecure,
            use_https: !self.http,
            ..Default::default()
        }
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }
}
