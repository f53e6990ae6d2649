use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Unit of the linear backoff in the link establishment pipeline: a candidate that failed
    ///  `n` times waits `(n+1) * throttle_delay` before it is probed again.
    pub throttle_delay: Duration,
    /// Number of failed candidates that are handled (persisted, delayed and resubmitted)
    ///  concurrently.
    pub retry_parallelism: usize,

    /// Bounded capacity of the data plane's send and receive stages. A slow consumer stalls the
    ///  producer once this many messages are queued.
    pub link_queue_capacity: usize,

    /// Used for connect when neither the caller nor the socket info specify a timeout
    pub connect_timeout: Duration,
    pub unlink_timeout: Duration,
    /// RPC timeout for link, open and option calls
    pub option_timeout: Duration,
    pub probe_timeout: Duration,

    /// proxy side: lower bound for the idle timeout of a link
    pub min_link_timeout: Duration,
    /// proxy side: ports that active links must not connect to
    pub restricted_ports: FxHashSet<u16>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            throttle_delay: Duration::from_secs(3),
            retry_parallelism: 2,
            link_queue_capacity: 3,
            connect_timeout: Duration::from_secs(30),
            unlink_timeout: Duration::from_secs(10),
            option_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            min_link_timeout: Duration::from_secs(30),
            restricted_ports: Default::default(),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.link_queue_capacity == 0 {
            bail!("link queue capacity must be positive");
        }
        if self.retry_parallelism == 0 {
            bail!("retry parallelism must be positive");
        }

        for (name, timeout) in [
            ("connect timeout", self.connect_timeout),
            ("unlink timeout", self.unlink_timeout),
            ("option timeout", self.option_timeout),
            ("probe timeout", self.probe_timeout),
            ("min link timeout", self.min_link_timeout),
        ] {
            if timeout.is_zero() {
                bail!("{} must not be zero", name);
            }
        }
        Ok(())
    }

    /// The timeout for establishing a link: the socket's own timeout if it has one, the
    ///  configured default otherwise
    pub fn effective_connect_timeout(&self, socket_timeout_millis: u32) -> Duration {
        if socket_timeout_millis == 0 {
            self.connect_timeout
        }
        else {
            Duration::from_millis(socket_timeout_millis as u64)
        }
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::queue(|c: &mut ProxyConfig| c.link_queue_capacity = 0)]
    #[case::parallelism(|c: &mut ProxyConfig| c.retry_parallelism = 0)]
    #[case::connect(|c: &mut ProxyConfig| c.connect_timeout = Duration::ZERO)]
    #[case::probe(|c: &mut ProxyConfig| c.probe_timeout = Duration::ZERO)]
    fn test_validate_rejects(#[case] f: fn(&mut ProxyConfig)) {
        let mut config = ProxyConfig::default();
        f(&mut config);
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::default(0, Duration::from_secs(30))]
    #[case::explicit(1500, Duration::from_millis(1500))]
    fn test_effective_connect_timeout(#[case] millis: u32, #[case] expected: Duration) {
        assert_eq!(ProxyConfig::default().effective_connect_timeout(millis), expected);
    }
}
