use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use serde_json::Value;

use crate::constants::{default_port, MAX_RECENT_SERVERS, PROTOCOL_VERSION};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Proto {
    Tcp,
    Ssl,
}

impl Proto {
    pub fn letter(&self) -> char {
        match self {
            Proto::Tcp => 't',
            Proto::Ssl => 's',
        }
    }
}

impl FromStr for Proto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "t" => Ok(Proto::Tcp),
            "s" => Ok(Proto::Ssl),
            _ => Err(Error::BadServerString(s.to_string())),
        }
    }
}

impl Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// One remote electrum server, canonical form `host:port:s|t`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
    pub proto: Proto,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16, proto: Proto) -> Self {
        Self {
            host: host.into(),
            port,
            proto,
        }
    }

    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }
}

impl Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.proto)
    }
}

impl FromStr for ServerAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || Error::BadServerString(s.to_string());
        let mut it = s.split(':');
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(host), Some(port), Some(proto), None) if !host.is_empty() => Ok(ServerAddr {
                host: host.to_string(),
                port: port.parse().map_err(|_| bad())?,
                proto: proto.parse().map_err(|_| bad())?,
            }),
            _ => Err(bad()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Socks4,
    Socks5,
}

impl Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyMode::Socks4 => write!(f, "socks4"),
            ProxyMode::Socks5 => write!(f, "socks5"),
        }
    }
}

impl FromStr for ProxyMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "socks4" => Ok(ProxyMode::Socks4),
            "socks5" => Ok(ProxyMode::Socks5),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub mode: ProxyMode,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxySpec {
    /// `mode:host:port:user:pw`, user/pw as empty strings when absent.
    pub fn serialize(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.mode,
            self.host,
            self.port,
            self.user.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or(""),
        )
    }

    /// Lenient parse: every token is optional, `"none"` means no proxy.
    /// Unparseable ports fall back to the default rather than failing, the
    /// strict check happens in `Network::set_parameters`.
    pub fn deserialize(s: &str) -> Option<ProxySpec> {
        if s.eq_ignore_ascii_case("none") {
            return None;
        }
        let mut proxy = ProxySpec {
            mode: ProxyMode::Socks5,
            host: "localhost".to_string(),
            port: 1080,
            user: None,
            password: None,
        };
        let mut args = s.split(':').peekable();
        if let Some(tok) = args.peek() {
            if let Ok(mode) = tok.parse() {
                proxy.mode = mode;
                args.next();
            }
        }
        if let Some(host) = args.next() {
            if !host.is_empty() {
                proxy.host = host.to_string();
            }
        }
        if let Some(port) = args.next() {
            if let Ok(port) = port.parse() {
                proxy.port = port;
            }
        }
        proxy.user = args.next().filter(|s| !s.is_empty()).map(str::to_string);
        proxy.password = args.next().filter(|s| !s.is_empty()).map(str::to_string);
        Some(proxy)
    }
}

/// What a peer advertises in `server.peers.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFeatures {
    pub ports: HashMap<Proto, u16>,
    pub version: Option<String>,
    pub pruning: String,
}

pub type ServerMap = HashMap<String, ServerFeatures>;

fn digits_after(s: &str, prefix: char) -> Option<&str> {
    let rest = s.strip_prefix(prefix)?;
    rest.chars().all(|c| c.is_ascii_digit()).then_some(rest)
}

/// Parse the raw `server.peers.subscribe` reply, a list of
/// `[ip, host, [feature, ...]]` entries, into a host map.
pub fn parse_servers(result: &[Value]) -> ServerMap {
    let mut servers = ServerMap::new();
    for item in result {
        let Some(host) = item.get(1).and_then(Value::as_str) else {
            continue;
        };
        let mut ports = HashMap::new();
        let mut version = None;
        let mut pruning = "-".to_string();
        if let Some(features) = item.get(2).and_then(Value::as_array) {
            for v in features.iter().filter_map(Value::as_str) {
                if let Some(port) = digits_after(v, 's').or_else(|| digits_after(v, 't')) {
                    let proto = if v.starts_with('s') { Proto::Ssl } else { Proto::Tcp };
                    let port = if port.is_empty() {
                        default_port(proto)
                    } else {
                        match port.parse() {
                            Ok(p) => p,
                            Err(_) => continue,
                        }
                    };
                    ports.insert(proto, port);
                } else if let Some(rest) = v.strip_prefix('v') {
                    if !rest.is_empty() {
                        version = Some(rest.to_string());
                    }
                } else if let Some(level) = digits_after(v, 'p') {
                    pruning = if level.is_empty() { "0" } else { level }.to_string();
                }
            }
        }
        if !ports.is_empty() {
            servers.insert(
                host.to_string(),
                ServerFeatures {
                    ports,
                    version,
                    pruning,
                },
            );
        }
    }
    servers
}

/// Inverse of the feature parsing in [`parse_servers`], used when
/// re-advertising known peers.
pub fn format_features(features: &ServerFeatures) -> Vec<String> {
    let mut out = Vec::new();
    let mut ports: Vec<_> = features.ports.iter().collect();
    ports.sort();
    for (proto, port) in ports {
        out.push(format!("{proto}{port}"));
    }
    if let Some(version) = &features.version {
        out.push(format!("v{version}"));
    }
    if features.pruning != "-" {
        out.push(format!("p{}", features.pruning));
    }
    out
}

pub(crate) fn versiontuple(v: &str) -> Option<Vec<u32>> {
    v.split('.').map(|part| part.parse().ok()).collect()
}

/// Keep only peers whose advertised protocol version is recent enough.
pub fn filter_version(servers: ServerMap) -> ServerMap {
    let required = versiontuple(PROTOCOL_VERSION).expect("const version parses");
    servers
        .into_iter()
        .filter(|(_, f)| {
            f.version
                .as_deref()
                .and_then(versiontuple)
                .map(|v| v >= required)
                .unwrap_or(false)
        })
        .collect()
}

pub fn filter_noonion(servers: ServerMap) -> ServerMap {
    servers
        .into_iter()
        .filter(|(host, _)| !host.ends_with(".onion"))
        .collect()
}

/// The hosts implementing `proto`, in connectable form.
pub fn filter_protocol(servers: &ServerMap, proto: Proto) -> Vec<ServerAddr> {
    let mut eligible: Vec<_> = servers
        .iter()
        .filter_map(|(host, f)| {
            f.ports
                .get(&proto)
                .map(|port| ServerAddr::new(host.clone(), *port, proto))
        })
        .collect();
    eligible.sort_by(|a, b| a.host.cmp(&b.host));
    eligible
}

pub fn pick_random_server(
    servers: &ServerMap,
    proto: Proto,
    exclude: &HashSet<ServerAddr>,
) -> Option<ServerAddr> {
    let eligible: Vec<_> = filter_protocol(servers, proto)
        .into_iter()
        .filter(|s| !exclude.contains(s))
        .collect();
    if eligible.is_empty() {
        None
    } else {
        Some(eligible[fastrand::usize(..eligible.len())].clone())
    }
}

/// Ordered most-recent first, bounded, persisted as a pretty JSON array.
pub struct RecentServers {
    list: Vec<ServerAddr>,
    path: Option<PathBuf>,
}

impl RecentServers {
    pub fn load(datadir: Option<&std::path::Path>) -> Self {
        let path = datadir.map(|d| d.join("recent_servers"));
        let list = path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|data| serde_json::from_str::<Vec<String>>(&data).ok())
            .map(|strings| {
                strings
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        Self { list, path }
    }

    pub fn get(&self) -> &[ServerAddr] {
        &self.list
    }

    pub fn add(&mut self, server: ServerAddr) {
        self.list.retain(|s| s != &server);
        self.list.insert(0, server);
        self.list.truncate(MAX_RECENT_SERVERS);
        self.save();
    }

    /// Best-effort atomic write, failures are ignored.
    fn save(&self) {
        let Some(path) = &self.path else { return };
        let strings: Vec<_> = self.list.iter().map(ServerAddr::to_string).collect();
        let Ok(data) = serde_json::to_string_pretty(&strings) else {
            return;
        };
        let tmp = path.with_extension("tmp");
        if std::fs::write(&tmp, data).is_ok() {
            let _ = std::fs::rename(&tmp, path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_addr_roundtrip() {
        for s in ["a.example:50002:s", "b.example:50001:t", "x.onion:1:s"] {
            let addr: ServerAddr = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
        let addr: ServerAddr = "a.example:50002:s".parse().unwrap();
        assert_eq!(addr.host, "a.example");
        assert_eq!(addr.port, 50002);
        assert_eq!(addr.proto, Proto::Ssl);
    }

    #[test]
    fn server_addr_rejects() {
        for s in [
            "",
            "host",
            "host:50002",
            "host:50002:x",
            "host:notaport:s",
            "host:50002:s:extra",
            ":50002:s",
        ] {
            assert!(
                matches!(s.parse::<ServerAddr>(), Err(Error::BadServerString(_))),
                "accepted {s:?}"
            );
        }
    }

    #[test]
    fn proxy_roundtrip() {
        let p = ProxySpec {
            mode: ProxyMode::Socks4,
            host: "10.0.0.1".into(),
            port: 9050,
            user: Some("u".into()),
            password: Some("pw".into()),
        };
        assert_eq!(p.serialize(), "socks4:10.0.0.1:9050:u:pw");
        assert_eq!(ProxySpec::deserialize(&p.serialize()), Some(p));
        assert_eq!(ProxySpec::deserialize("none"), None);
        assert_eq!(ProxySpec::deserialize("NONE"), None);
    }

    #[test]
    fn proxy_defaults() {
        let p = ProxySpec::deserialize("myhost").unwrap();
        assert_eq!(p.mode, ProxyMode::Socks5);
        assert_eq!(p.host, "myhost");
        assert_eq!(p.port, 1080);
        assert_eq!(p.user, None);

        let p = ProxySpec::deserialize("socks4").unwrap();
        assert_eq!(p.mode, ProxyMode::Socks4);
        assert_eq!(p.host, "localhost");
    }

    fn peers_reply() -> Vec<Value> {
        vec![
            json!(["1.2.3.4", "a.example", ["v1.4", "s50002", "t50001", "p100"]]),
            json!(["5.6.7.8", "b.example", ["v1.2", "s"]]),
            json!(["9.9.9.9", "noports.example", ["v1.4"]]),
            json!(["7.7.7.7", "c.onion", ["v1.4.2", "t"]]),
        ]
    }

    #[test]
    fn parse_servers_shapes() {
        let servers = parse_servers(&peers_reply());
        assert_eq!(servers.len(), 3);
        let a = &servers["a.example"];
        assert_eq!(a.ports[&Proto::Ssl], 50002);
        assert_eq!(a.ports[&Proto::Tcp], 50001);
        assert_eq!(a.version.as_deref(), Some("1.4"));
        assert_eq!(a.pruning, "100");
        // empty port token means the default port for that protocol
        assert_eq!(servers["b.example"].ports[&Proto::Ssl], 50002);
        assert_eq!(servers["c.onion"].ports[&Proto::Tcp], 50001);
        assert!(!servers.contains_key("noports.example"));
    }

    #[test]
    fn format_features_roundtrip() {
        let servers = parse_servers(&peers_reply());
        for (host, features) in &servers {
            let listed: Vec<Value> = format_features(features)
                .into_iter()
                .map(Value::from)
                .collect();
            let reparsed = parse_servers(&[json!(["0.0.0.0", host, listed])]);
            assert_eq!(&reparsed[host.as_str()], features);
        }
    }

    #[test]
    fn filters() {
        let servers = parse_servers(&peers_reply());
        let recent = filter_version(servers.clone());
        assert!(recent.contains_key("a.example"));
        assert!(recent.contains_key("c.onion")); // 1.4.2 >= 1.4
        assert!(!recent.contains_key("b.example")); // 1.2 too old

        let clear = filter_noonion(servers.clone());
        assert!(!clear.contains_key("c.onion"));

        // hosts missing the requested protocol port are excluded
        let ssl = filter_protocol(&servers, Proto::Ssl);
        assert!(ssl.iter().all(|s| s.proto == Proto::Ssl));
        assert!(!ssl.iter().any(|s| s.host == "c.onion"));
    }

    #[test]
    fn pick_random_respects_exclusions() {
        let servers = parse_servers(&peers_reply());
        let mut exclude = HashSet::new();
        exclude.insert(ServerAddr::new("a.example", 50002, Proto::Ssl));
        exclude.insert(ServerAddr::new("b.example", 50002, Proto::Ssl));
        assert_eq!(pick_random_server(&servers, Proto::Ssl, &exclude), None);
        exclude.remove(&ServerAddr::new("a.example", 50002, Proto::Ssl));
        assert_eq!(
            pick_random_server(&servers, Proto::Ssl, &exclude),
            Some(ServerAddr::new("a.example", 50002, Proto::Ssl))
        );
    }

    #[test]
    fn recent_servers_bounded_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut recent = RecentServers::load(Some(dir.path()));
        for i in 0..30 {
            recent.add(ServerAddr::new(format!("s{i}.example"), 50001, Proto::Tcp));
        }
        recent.add(ServerAddr::new("s5.example", 50001, Proto::Tcp));
        assert_eq!(recent.get().len(), MAX_RECENT_SERVERS);
        assert_eq!(recent.get()[0].host, "s5.example");
        // re-adding moved it to the front without duplicating
        assert_eq!(
            recent.get().iter().filter(|s| s.host == "s5.example").count(),
            1
        );

        let reloaded = RecentServers::load(Some(dir.path()));
        assert_eq!(reloaded.get(), recent.get());
    }
}
