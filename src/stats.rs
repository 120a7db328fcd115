use std::net::IpAddr;
use std::ops::Deref;

use crate::ping::ProbeOutcome;
use crate::utils::format_time;

/// Result of pinging one address.
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub address: IpAddr,
    pub packets_sent: u32,
    /// One round-trip time in milliseconds per Echo Reply, in probe order.
    pub rtts: Vec<f64>,
    /// IP TTL of the last Echo Reply, when the header was visible.
    pub ttl: Option<u8>,
}

impl Host {
    pub fn new(address: IpAddr, packets_sent: u32, rtts: Vec<f64>) -> Self {
        Self {
            address,
            packets_sent,
            rtts,
            ttl: None,
        }
    }

    pub fn packets_received(&self) -> u32 {
        self.rtts.len() as u32
    }

    /// Fraction in `[0, 1]`. Zero when nothing was sent.
    pub fn packet_loss(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        1.0 - f64::from(self.packets_received()) / f64::from(self.packets_sent)
    }

    pub fn min_rtt(&self) -> f64 {
        self.rtts.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    pub fn avg_rtt(&self) -> f64 {
        if self.rtts.is_empty() {
            return 0.0;
        }
        self.rtts.iter().sum::<f64>() / self.rtts.len() as f64
    }

    pub fn max_rtt(&self) -> f64 {
        self.rtts.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Mean absolute difference between consecutive samples.
    pub fn jitter(&self) -> f64 {
        if self.rtts.len() < 2 {
            return 0.0;
        }
        let total: f64 = self.rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        total / (self.rtts.len() - 1) as f64
    }

    pub fn is_alive(&self) -> bool {
        self.packets_sent > 0 && self.packet_loss() < 1.0
    }

    pub fn format_summary(&self) -> String {
        let mut summary = format!(
            "\n--- {} ping statistics ---\n{} packets transmitted, {} received, {:.0}% packet loss\n",
            self.address,
            self.packets_sent,
            self.packets_received(),
            self.packet_loss() * 100.0
        );

        if self.packets_received() > 0 {
            summary.push_str(&format!(
                "rtt min/avg/max/jitter = {:.3}/{:.3}/{:.3}/{:.3} ms\n",
                self.min_rtt(),
                self.avg_rtt(),
                self.max_rtt(),
                self.jitter()
            ));
        }

        summary
    }

    pub fn format_line(&self) -> String {
        if self.is_alive() {
            format!(
                "{:<40} up    {}/{} received, avg {}",
                self.address.to_string(),
                self.packets_received(),
                self.packets_sent,
                format_time(self.avg_rtt())
            )
        } else {
            format!("{:<40} down", self.address.to_string())
        }
    }
}

/// One responding gateway on a traced path.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub host: Host,
    /// The TTL that produced this hop.
    pub distance: u8,
}

impl Hop {
    pub fn new(address: IpAddr, packets_sent: u32, rtts: Vec<f64>, distance: u8) -> Self {
        Self {
            host: Host::new(address, packets_sent, rtts),
            distance,
        }
    }

    pub fn format_line(&self, name: Option<&str>) -> String {
        let who = match name {
            Some(name) => format!("{} [{}]", name, self.address),
            None => self.address.to_string(),
        };
        let times: Vec<String> = self.rtts.iter().map(|rtt| format_time(*rtt)).collect();
        format!("{:>3}  {}  {}", self.distance, who, times.join("  "))
    }
}

impl Deref for Hop {
    type Target = Host;

    fn deref(&self) -> &Host {
        &self.host
    }
}

/// Running counts while probes go out.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tally {
    pub packets_sent: u32,
    pub rtts: Vec<f64>,
    pub ttl: Option<u8>,
    pub last_source: Option<IpAddr>,
}

impl Tally {
    /// Ping accounting: only Echo Replies produce a sample.
    pub fn record(&mut self, outcome: &ProbeOutcome) {
        if outcome.was_sent() {
            self.packets_sent += 1;
        }
        if let ProbeOutcome::Echo { reply, rtt } = outcome {
            self.add_sample(reply.source, *rtt);
            self.ttl = reply.ttl.or(self.ttl);
        }
    }

    pub fn add_sample(&mut self, source: IpAddr, rtt: f64) {
        self.rtts.push(rtt);
        self.last_source = Some(source);
    }

    pub fn into_host(self, address: IpAddr) -> Host {
        Host {
            address,
            packets_sent: self.packets_sent,
            rtts: self.rtts,
            ttl: self.ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(rtts: &[f64], sent: u32) -> Host {
        Host::new("8.8.8.8".parse().unwrap(), sent, rtts.to_vec())
    }

    #[test]
    fn test_statistics_calculation() {
        let stats = host(&[10.5, 20.3], 3);

        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_received(), 2);
        assert!((stats.packet_loss() - 1.0 / 3.0).abs() < 0.0001);
        assert!((stats.avg_rtt() - 15.4).abs() < 1e-9);
        assert_eq!(stats.min_rtt(), 10.5);
        assert_eq!(stats.max_rtt(), 20.3);
        assert!(stats.is_alive());
    }

    #[test]
    fn test_jitter() {
        assert_eq!(host(&[10.0, 10.0, 10.0], 3).jitter(), 0.0);
        assert!((host(&[10.0, 20.0, 15.0], 3).jitter() - 7.5).abs() < 1e-9);
        assert_eq!(host(&[12.0], 1).jitter(), 0.0);
    }

    #[test]
    fn test_unreachable_host() {
        let stats = host(&[], 3);
        assert_eq!(stats.packet_loss(), 1.0);
        assert!(!stats.is_alive());
        assert_eq!(stats.min_rtt(), 0.0);
        assert_eq!(stats.avg_rtt(), 0.0);

        let idle = host(&[], 0);
        assert_eq!(idle.packet_loss(), 0.0);
        assert!(!idle.is_alive());
    }

    #[test]
    fn test_summary_formatting() {
        let summary = host(&[10.0], 2).format_summary();
        assert!(summary.contains("--- 8.8.8.8 ping statistics ---"));
        assert!(summary.contains("2 packets transmitted, 1 received, 50% packet loss"));
        assert!(summary.contains("rtt min/avg/max/jitter = 10.000/10.000/10.000/0.000 ms"));

        assert!(!host(&[], 2).format_summary().contains("rtt"));
    }

    #[test]
    fn test_hop_formatting() {
        let hop = Hop::new("10.0.0.1".parse().unwrap(), 2, vec![5.2, 0.4], 3);
        assert_eq!(hop.packets_received(), 2);
        assert_eq!(hop.format_line(None), "  3  10.0.0.1  5ms  <1ms");
        assert_eq!(
            hop.format_line(Some("gw.local")),
            "  3  gw.local [10.0.0.1]  5ms  <1ms"
        );
    }
}
