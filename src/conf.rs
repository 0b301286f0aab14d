// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Server configuration.
//!
//! The configuration is read from a YAML file (or standard input), normalized
//! and validated once at startup, and shared immutably afterwards. Every
//! missing option falls back to its documented default, so an empty file and a
//! missing `conf.yml` both yield a working server.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Transport used for the media payload of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamProtocol::Udp => write!(f, "udp"),
            StreamProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for StreamProtocol {
    type Err = ConfError;

    fn from_str(s: &str) -> Result<Self, ConfError> {
        match s {
            "udp" => Ok(StreamProtocol::Udp),
            "tcp" => Ok(StreamProtocol::Tcp),
            other => Err(ConfError::UnsupportedProtocol(other.into())),
        }
    }
}

/// A single address or a CIDR network in an allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpRange {
    Single(IpAddr),
    Net { base: IpAddr, prefix: u8 },
}

impl FromStr for IpRange {
    type Err = ConfError;

    fn from_str(s: &str) -> Result<Self, ConfError> {
        if let Some((addr, prefix)) = s.split_once('/') {
            let base: IpAddr = addr
                .parse()
                .map_err(|_| ConfError::InvalidIpRange(s.into()))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| ConfError::InvalidIpRange(s.into()))?;
            let max = match base {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(ConfError::InvalidIpRange(s.into()));
            }
            Ok(IpRange::Net { base, prefix })
        } else {
            let addr: IpAddr = s
                .parse()
                .map_err(|_| ConfError::InvalidIpRange(s.into()))?;
            Ok(IpRange::Single(addr))
        }
    }
}

impl IpRange {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = canonical_ip(ip);
        match *self {
            IpRange::Single(addr) => canonical_ip(addr) == ip,
            IpRange::Net { base, prefix } => match (canonical_ip(base), ip) {
                (IpAddr::V4(base), IpAddr::V4(ip)) => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u32::MAX << (32 - u32::from(prefix))
                    };
                    u32::from(base) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(base), IpAddr::V6(ip)) => {
                    let mask = if prefix == 0 {
                        0
                    } else {
                        u128::MAX << (128 - u32::from(prefix))
                    };
                    u128::from(base) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

/// Normalize IPv4-mapped IPv6 addresses so peers connecting over a dual-stack
/// socket compare equal to configured IPv4 entries.
pub(crate) fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Per-path policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathConf {
    /// `record` (stream is pushed by a client) or an upstream RTSP URL.
    pub source: String,
    /// Transport used when pulling from an upstream server.
    pub source_protocol: String,
    pub publish_user: String,
    pub publish_pass: String,
    pub publish_ips: Vec<String>,
    pub read_user: String,
    pub read_pass: String,
    pub read_ips: Vec<String>,

    #[serde(skip)]
    pub publish_ips_parsed: Vec<IpRange>,
    #[serde(skip)]
    pub read_ips_parsed: Vec<IpRange>,
    #[serde(skip)]
    pub source_url: Option<Url>,
    #[serde(skip)]
    pub source_protocol_parsed: Option<StreamProtocol>,
}

impl PathConf {
    fn check(&mut self, name: &str) -> Result<(), ConfError> {
        if self.source.is_empty() {
            self.source = "record".into();
        }

        check_credential_pair(
            &self.publish_user,
            &self.publish_pass,
            "publish username",
            "publish password",
        )?;
        check_credential_pair(
            &self.read_user,
            &self.read_pass,
            "read username",
            "read password",
        )?;

        self.publish_ips_parsed = parse_ip_ranges(&self.publish_ips)?;
        self.read_ips_parsed = parse_ip_ranges(&self.read_ips)?;

        if self.source != "record" {
            if name == "all" {
                return Err(ConfError::WildcardWithSource);
            }

            let url = Url::parse(&self.source)
                .map_err(|_| ConfError::InvalidSourceUrl(self.source.clone()))?;
            if url.scheme() != "rtsp" || url.host_str().is_none() {
                return Err(ConfError::InvalidSourceUrl(self.source.clone()));
            }
            self.source_url = Some(url);

            if self.source_protocol.is_empty() {
                self.source_protocol = "udp".into();
            }
            self.source_protocol_parsed = Some(self.source_protocol.parse()?);
        }

        Ok(())
    }
}

fn check_credential_pair(
    user: &str,
    pass: &str,
    user_label: &'static str,
    pass_label: &'static str,
) -> Result<(), ConfError> {
    if user.is_empty() != pass.is_empty() {
        return Err(ConfError::CredentialsHalfSet(user_label));
    }
    if !user.is_empty() && !user.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfError::NotAlphanumeric(user_label));
    }
    if !pass.is_empty() && !pass.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfError::NotAlphanumeric(pass_label));
    }
    Ok(())
}

fn parse_ip_ranges(input: &[String]) -> Result<Vec<IpRange>, ConfError> {
    input.iter().map(|s| s.parse()).collect()
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Conf {
    pub protocols: Vec<String>,
    pub rtsp_port: u16,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    pub pprof: bool,
    pub paths: BTreeMap<String, PathConf>,

    #[serde(skip)]
    protocols_parsed: Vec<StreamProtocol>,
}

impl Default for Conf {
    fn default() -> Self {
        Conf {
            protocols: vec!["udp".into(), "tcp".into()],
            rtsp_port: 8554,
            rtp_port: 8000,
            rtcp_port: 8001,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            pre_script: None,
            post_script: None,
            pprof: false,
            paths: BTreeMap::new(),
            protocols_parsed: Vec::new(),
        }
    }
}

impl Conf {
    /// Load and validate a configuration.
    ///
    /// `stdin` reads from standard input. The default `conf.yml` is optional:
    /// when the file does not exist the built-in defaults are used.
    pub fn load(fpath: &str) -> Result<Conf, ConfError> {
        let mut conf: Conf = if fpath == "stdin" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            serde_yaml::from_str(&buf)?
        } else if fpath == "conf.yml" && !Path::new(fpath).exists() {
            Conf::default()
        } else {
            let data = std::fs::read_to_string(fpath)?;
            serde_yaml::from_str(&data)?
        };

        conf.check()?;
        Ok(conf)
    }

    /// Normalize defaults and validate. Must run before the configuration is
    /// handed to the server.
    pub fn check(&mut self) -> Result<(), ConfError> {
        if self.protocols.is_empty() {
            return Err(ConfError::NoProtocols);
        }
        self.protocols_parsed.clear();
        for name in &self.protocols {
            let protocol = name.parse()?;
            if !self.protocols_parsed.contains(&protocol) {
                self.protocols_parsed.push(protocol);
            }
        }

        if self.rtp_port % 2 != 0 {
            return Err(ConfError::OddRtpPort);
        }
        if self.rtcp_port != self.rtp_port + 1 {
            return Err(ConfError::NonConsecutivePorts);
        }

        if self.paths.is_empty() {
            self.paths.insert("all".into(), PathConf::default());
        }
        for (name, pconf) in self.paths.iter_mut() {
            pconf.check(name)?;
        }

        Ok(())
    }

    pub fn protocol_allowed(&self, protocol: StreamProtocol) -> bool {
        self.protocols_parsed.contains(&protocol)
    }

    /// Resolve the policy for a path, falling back to the `all` wildcard.
    pub fn path_conf(&self, path: &str) -> Option<&PathConf> {
        self.paths.get(path).or_else(|| self.paths.get("all"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("no protocols provided")]
    NoProtocols,
    #[error("rtp port must be even")]
    OddRtpPort,
    #[error("rtcp and rtp ports must be consecutive")]
    NonConsecutivePorts,
    #[error("unable to parse ip/network '{0}'")]
    InvalidIpRange(String),
    #[error("{0} must be alphanumeric")]
    NotAlphanumeric(&'static str),
    #[error("{0} and password must be both filled")]
    CredentialsHalfSet(&'static str),
    #[error("path 'all' cannot have a RTSP source")]
    WildcardWithSource,
    #[error("invalid source url '{0}'")]
    InvalidSourceUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Conf, ConfError> {
        let mut conf: Conf = serde_yaml::from_str(yaml).map_err(ConfError::from)?;
        conf.check()?;
        Ok(conf)
    }

    #[test]
    fn empty_input_yields_defaults() {
        let conf = parse("{}").unwrap();
        assert_eq!(conf.rtsp_port, 8554);
        assert_eq!(conf.rtp_port, 8000);
        assert_eq!(conf.rtcp_port, 8001);
        assert_eq!(conf.read_timeout, Duration::from_secs(5));
        assert!(conf.protocol_allowed(StreamProtocol::Udp));
        assert!(conf.protocol_allowed(StreamProtocol::Tcp));
        assert!(conf.paths.contains_key("all"));
    }

    #[test]
    fn empty_paths_map_is_wildcard() {
        let conf = parse("paths: {}").unwrap();
        assert!(conf.path_conf("anything").is_some());
    }

    #[test]
    fn odd_rtp_port_is_rejected() {
        let err = parse("rtpPort: 8001\nrtcpPort: 8002").unwrap_err();
        assert!(matches!(err, ConfError::OddRtpPort));
    }

    #[test]
    fn non_consecutive_rtcp_port_is_rejected() {
        let err = parse("rtpPort: 8000\nrtcpPort: 8005").unwrap_err();
        assert!(matches!(err, ConfError::NonConsecutivePorts));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let err = parse("protocols: [sctp]").unwrap_err();
        assert!(matches!(err, ConfError::UnsupportedProtocol(_)));
    }

    #[test]
    fn no_protocols_is_rejected() {
        let err = parse("protocols: []").unwrap_err();
        assert!(matches!(err, ConfError::NoProtocols));
    }

    #[test]
    fn duplicate_protocols_collapse() {
        let conf = parse("protocols: [udp, tcp, udp]").unwrap();
        assert_eq!(conf.protocols_parsed.len(), 2);
        assert!(conf.protocol_allowed(StreamProtocol::Udp));
        assert!(conf.protocol_allowed(StreamProtocol::Tcp));
    }

    #[test]
    fn durations_parse_from_human_strings() {
        let conf = parse("readTimeout: 10s\nwriteTimeout: 1500ms").unwrap();
        assert_eq!(conf.read_timeout, Duration::from_secs(10));
        assert_eq!(conf.write_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn credentials_must_be_alphanumeric() {
        let err = parse("paths:\n  cam:\n    publishUser: 'us:er'\n    publishPass: pw1").unwrap_err();
        assert!(matches!(err, ConfError::NotAlphanumeric(_)));
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let err = parse("paths:\n  cam:\n    readUser: admin").unwrap_err();
        assert!(matches!(err, ConfError::CredentialsHalfSet(_)));
        let err = parse("paths:\n  cam:\n    publishPass: secret1").unwrap_err();
        assert!(matches!(err, ConfError::CredentialsHalfSet(_)));
    }

    #[test]
    fn wildcard_path_cannot_pull() {
        let err = parse("paths:\n  all:\n    source: rtsp://host/stream").unwrap_err();
        assert!(matches!(err, ConfError::WildcardWithSource));
    }

    #[test]
    fn source_url_is_parsed_with_default_protocol() {
        let conf = parse("paths:\n  mirror:\n    source: rtsp://host:8554/stream").unwrap();
        let pconf = &conf.paths["mirror"];
        assert!(pconf.source_url.is_some());
        assert_eq!(pconf.source_protocol_parsed, Some(StreamProtocol::Udp));
    }

    #[test]
    fn bad_source_url_is_rejected() {
        let err = parse("paths:\n  mirror:\n    source: 'http://host/x'").unwrap_err();
        assert!(matches!(err, ConfError::InvalidSourceUrl(_)));
    }

    #[test]
    fn specific_path_beats_wildcard() {
        let conf = parse("paths:\n  all:\n    readUser: usr\n    readPass: pw\n  open: {}").unwrap();
        assert!(conf.path_conf("open").unwrap().read_user.is_empty());
        assert_eq!(conf.path_conf("other").unwrap().read_user, "usr");
    }

    #[test]
    fn ip_range_parses_single_and_cidr() {
        let single: IpRange = "192.168.1.7".parse().unwrap();
        assert!(single.contains("192.168.1.7".parse().unwrap()));
        assert!(!single.contains("192.168.1.8".parse().unwrap()));

        let net: IpRange = "10.0.0.0/8".parse().unwrap();
        assert!(net.contains("10.200.3.4".parse().unwrap()));
        assert!(!net.contains("11.0.0.1".parse().unwrap()));

        assert!("10.0.0.0/33".parse::<IpRange>().is_err());
        assert!("not-an-ip".parse::<IpRange>().is_err());
    }

    #[test]
    fn ip_range_matches_mapped_v6_peers() {
        let net: IpRange = "127.0.0.0/8".parse().unwrap();
        let mapped: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert!(net.contains(mapped));
    }
}
