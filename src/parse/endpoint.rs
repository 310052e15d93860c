use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network location of a bound database node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterEndpoint {
    pub host: String,
    pub port: u16,
}

impl ClusterEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ClusterEndpoint {
    type Err = HarnessError;

    // Splits on the last colon followed by a port that does not start with 0,
    // so "::1:27017" keeps "::1" as host.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| HarnessError::Config(format!("`{s}` is not host:port")))?;
        if host.is_empty() || port.starts_with('0') {
            return Err(HarnessError::Config(format!("`{s}` is not host:port")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| HarnessError::Config(format!("bad port in `{s}`: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for ClusterEndpoint {
    type Error = HarnessError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ClusterEndpoint> for String {
    fn from(e: ClusterEndpoint) -> Self {
        e.to_string()
    }
}

/*
    @@@
    @parse_members();
    . Splits a comma separated replica-set string ("h1:p1,h2:p2") into ordered endpoints.
    . Blank entries are skipped; an empty result is a configuration error.
*/
pub fn parse_members(list: &str) -> Result<Vec<ClusterEndpoint>> {
    let members = list
        .split(',')
        .filter(|m| !m.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<ClusterEndpoint>>>()?;
    if members.is_empty() {
        return Err(HarnessError::Config("replica-set member list is empty".into()));
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let e: ClusterEndpoint = "localhost:37017".parse().unwrap();
        assert_eq!(e, ClusterEndpoint::new("localhost", 37017));
        assert_eq!(e.to_string(), "localhost:37017");
    }

    #[test]
    fn keeps_ipv6_colons_in_host() {
        let e: ClusterEndpoint = "::1:27017".parse().unwrap();
        assert_eq!(e.host, "::1");
        assert_eq!(e.port, 27017);
    }

    #[test]
    fn rejects_missing_or_zero_led_port() {
        assert!("localhost".parse::<ClusterEndpoint>().is_err());
        assert!("localhost:".parse::<ClusterEndpoint>().is_err());
        assert!("localhost:0123".parse::<ClusterEndpoint>().is_err());
        assert!(":27017".parse::<ClusterEndpoint>().is_err());
    }

    #[test]
    fn member_list_keeps_order() {
        let members = parse_members("a:1, b:2,,c:3").unwrap();
        let hosts: Vec<_> = members.iter().map(|m| m.host.as_str()).collect();
        assert_eq!(hosts, ["a", "b", "c"]);
        assert!(parse_members(" , ").is_err());
    }
}
