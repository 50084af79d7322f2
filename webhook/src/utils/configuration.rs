/*
This File contains the command line / environment
configuration of the placement webhook.
*/

use std::{
    fmt,
    net::{
        IpAddr,
        SocketAddr
    },
    path::PathBuf,
    time::Duration
};
use clap::Parser;

use crate::utils::retry::{
    RetryPolicy,
    MAX_JITTER
};



/*
This function parses the decision jitter: a finite
fraction in [0, 1).
*/
fn parse_jitter(value: &str) -> Result<f64, String> {
    let jitter: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if !jitter.is_finite() || !(0.0..1.0).contains(&jitter) {
        return Err(format!("{value} is not a fraction in [0, 1)"));
    }
    Ok(jitter)
}

/*
Webhook configuration parameters.
Every flag can also be provided through
the environment variable named next to it.
*/
#[derive(Parser, Clone, Debug)]
#[command(name = "spot-placement-webhook", version, about = "Admission webhook steering workload replicas between on-demand and spot capacity")]
pub struct WebhookConfig {
    /// IP address on which to serve HTTPS
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Port on which to serve HTTPS
    #[arg(long, env = "SECURE_PORT", default_value_t = 8443)]
    pub secure_port: u16,

    /// Directory holding the serving certificate and key
    #[arg(long, env = "CERT_DIR", default_value = "/tmp/k8s-webhook-server/serving-certs")]
    pub cert_dir: PathBuf,

    /// Serving certificate file name inside the cert dir
    #[arg(long, env = "CERT_NAME", default_value = "tls.crt")]
    pub cert_name: String,

    /// Private key file name inside the cert dir
    #[arg(long, env = "KEY_NAME", default_value = "tls.key")]
    pub key_name: String,

    /// Attempts made by a placement decision while the cache converges
    #[arg(long, env = "DECISION_MAX_ATTEMPTS", default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub decision_max_attempts: u32,

    /// Delay between two decision attempts, in milliseconds
    #[arg(long, env = "DECISION_BACKOFF_MS", default_value_t = 100)]
    pub decision_backoff_ms: u64,

    /// Jitter fraction applied to every decision delay
    #[arg(long, env = "DECISION_JITTER", default_value_t = 0.1, value_parser = parse_jitter)]
    pub decision_jitter: f64,

    /// Upper bound on the initial cache sync, in seconds
    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = 120)]
    pub cache_sync_timeout_secs: u64,
}

impl WebhookConfig {
    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.secure_port)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.cert_name)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.key_name)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /*
    This function builds the retry policy used by
    the decision engine out of the configured values.
    */
    pub fn decision_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.decision_max_attempts,
            base_delay: Duration::from_millis(self.decision_backoff_ms),
            jitter: self.decision_jitter.clamp(0.0, MAX_JITTER),
        }
    }
}

/*
This function implements the Display trait for the
WebhookConfig struct to allow easy printing of its values.
*/
impl fmt::Display for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Webhook configuration:")?;
        writeln!(f, "    Listen address: {}", self.listen_address())?;
        writeln!(f, "    Certificate: {}", self.cert_path().display())?;
        writeln!(f, "    Key: {}", self.key_path().display())?;
        writeln!(f, "    Decision attempts: {}", self.decision_max_attempts)?;
        writeln!(f, "    Decision backoff: {}ms (jitter {})", self.decision_backoff_ms, self.decision_jitter)?;
        writeln!(f, "    Longest decision wait: {}ms", self.decision_retry_policy().max_total_delay().as_millis())?;
        write!(f, "    Cache sync timeout: {}s", self.cache_sync_timeout_secs)
    }
}
