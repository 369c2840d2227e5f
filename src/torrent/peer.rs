use std::{
    fmt::{self, Display},
    net::{Ipv4Addr, Ipv6Addr},
};

/// A peer as reported by the tracker. The 20-byte wire identity is only
/// learned later, during the handshake; dictionary-model trackers may send a
/// textual id ahead of time.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Peer {
    pub peer_id: Option<String>,
    pub ip: Ip,
    pub port: u16,
}

impl Peer {
    /// `host:port` form used to dial and to key the peer everywhere else.
    pub fn address(&self) -> String {
        match &self.ip {
            Ip::V6(ipv6) => format!("[{}]:{}", ipv6, self.port),
            other => format!("{}:{}", other, self.port),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Ip {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Dns(String),
}

impl Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ip::V4(ipv4) => write!(f, "{}", ipv4),
            Ip::V6(ipv6) => write!(f, "{}", ipv6),
            Ip::Dns(dns) => write!(f, "{}", dns),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats_dialable_addresses() {
        let v4 = Peer {
            peer_id: None,
            ip: Ip::V4(Ipv4Addr::new(10, 0, 0, 7)),
            port: 6881,
        };
        assert_eq!(v4.address(), "10.0.0.7:6881");

        let v6 = Peer {
            peer_id: None,
            ip: Ip::V6(Ipv6Addr::LOCALHOST),
            port: 6881,
        };
        assert_eq!(v6.address(), "[::1]:6881");

        let dns = Peer {
            peer_id: None,
            ip: Ip::Dns("seed.example".to_string()),
            port: 51413,
        };
        assert_eq!(dns.address(), "seed.example:51413");
    }
}
