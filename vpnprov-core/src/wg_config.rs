//! The client-side WireGuard configuration handed to end users.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PERSISTENT_KEEPALIVE: u16 = 25;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigParseError {
    #[error("missing [{0}] section")]
    MissingSection(&'static str),
    #[error("missing {field} in [{section}]")]
    MissingField {
        section: &'static str,
        field: &'static str,
    },
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub private_key: String,
    pub address: Ipv4Addr,
    pub dns: Vec<String>,
    pub server_public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: u16,
}

impl ClientConfig {
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", self.private_key)?;
        writeln!(f, "Address = {}/32", self.address)?;
        writeln!(f, "DNS = {}", self.dns.join(", "))?;
        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", self.server_public_key)?;
        if let Some(psk) = &self.preshared_key {
            writeln!(f, "PresharedKey = {psk}")?;
        }
        writeln!(f, "Endpoint = {}", self.endpoint)?;
        writeln!(f, "AllowedIPs = {}", self.allowed_ips.join(", "))?;
        writeln!(f, "PersistentKeepalive = {}", self.persistent_keepalive)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

#[derive(Default)]
struct Fields {
    private_key: Option<String>,
    address: Option<Ipv4Addr>,
    dns: Vec<String>,
    public_key: Option<String>,
    preshared_key: Option<String>,
    endpoint: Option<String>,
    allowed_ips: Option<Vec<String>>,
    keepalive: Option<u16>,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl FromStr for ClientConfig {
    type Err = ConfigParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut section = Section::None;
        let mut seen_interface = false;
        let mut seen_peer = false;
        let mut fields = Fields::default();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                section = match line.to_ascii_lowercase().as_str() {
                    "[interface]" => {
                        seen_interface = true;
                        Section::Interface
                    }
                    "[peer]" => {
                        seen_peer = true;
                        Section::Peer
                    }
                    other => {
                        return Err(ConfigParseError::Malformed {
                            line: line_no,
                            reason: format!("unknown section {other}"),
                        });
                    }
                };
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigParseError::Malformed {
                    line: line_no,
                    reason: "expected key = value".to_string(),
                });
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match (section, key.as_str()) {
                (Section::Interface, "privatekey") => fields.private_key = Some(value.to_string()),
                (Section::Interface, "address") => {
                    let host = value.split('/').next().unwrap_or(value).trim();
                    let addr = host.parse().map_err(|_| ConfigParseError::Malformed {
                        line: line_no,
                        reason: format!("invalid address {value}"),
                    })?;
                    fields.address = Some(addr);
                }
                (Section::Interface, "dns") => fields.dns = split_list(value),
                (Section::Peer, "publickey") => fields.public_key = Some(value.to_string()),
                (Section::Peer, "presharedkey") => fields.preshared_key = Some(value.to_string()),
                (Section::Peer, "endpoint") => fields.endpoint = Some(value.to_string()),
                (Section::Peer, "allowedips") => fields.allowed_ips = Some(split_list(value)),
                (Section::Peer, "persistentkeepalive") => {
                    let secs = value.parse().map_err(|_| ConfigParseError::Malformed {
                        line: line_no,
                        reason: format!("invalid keepalive {value}"),
                    })?;
                    fields.keepalive = Some(secs);
                }
                (Section::None, _) => {
                    return Err(ConfigParseError::Malformed {
                        line: line_no,
                        reason: "key outside of a section".to_string(),
                    });
                }
                // Unknown keys (MTU, ListenPort, ...) are tolerated.
                _ => {}
            }
        }

        if !seen_interface {
            return Err(ConfigParseError::MissingSection("Interface"));
        }
        if !seen_peer {
            return Err(ConfigParseError::MissingSection("Peer"));
        }

        let missing = |section, field| ConfigParseError::MissingField { section, field };
        Ok(ClientConfig {
            private_key: fields
                .private_key
                .ok_or_else(|| missing("Interface", "PrivateKey"))?,
            address: fields.address.ok_or_else(|| missing("Interface", "Address"))?,
            dns: fields.dns,
            server_public_key: fields.public_key.ok_or_else(|| missing("Peer", "PublicKey"))?,
            preshared_key: fields.preshared_key,
            endpoint: fields.endpoint.ok_or_else(|| missing("Peer", "Endpoint"))?,
            allowed_ips: fields
                .allowed_ips
                .ok_or_else(|| missing("Peer", "AllowedIPs"))?,
            persistent_keepalive: fields.keepalive.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientConfig {
        ClientConfig {
            private_key: "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=".to_string(),
            address: Ipv4Addr::new(10, 8, 0, 2),
            dns: vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()],
            server_public_key: "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=".to_string(),
            preshared_key: Some("FpCyhws9cxwWoV4xELtfJvjJN+zQVRPISllRWgeopVE=".to_string()),
            endpoint: "vpn.example.net:51820".to_string(),
            allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            persistent_keepalive: DEFAULT_PERSISTENT_KEEPALIVE,
        }
    }

    #[test]
    fn renders_fixed_layout() {
        let text = sample().render();
        let expected = "[Interface]\n\
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=\n\
Address = 10.8.0.2/32\n\
DNS = 1.1.1.1, 1.0.0.1\n\
\n\
[Peer]\n\
PublicKey = xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=\n\
PresharedKey = FpCyhws9cxwWoV4xELtfJvjJN+zQVRPISllRWgeopVE=\n\
Endpoint = vpn.example.net:51820\n\
AllowedIPs = 0.0.0.0/0, ::/0\n\
PersistentKeepalive = 25\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn omits_preshared_key_line_when_absent() {
        let mut config = sample();
        config.preshared_key = None;
        let text = config.render();
        assert!(!text.contains("PresharedKey"));
        let parsed: ClientConfig = text.parse().expect("parse");
        assert!(parsed.preshared_key.is_none());
    }

    #[test]
    fn parse_recovers_rendered_values() {
        let original = sample();
        let parsed: ClientConfig = original.render().parse().expect("parse");
        assert_eq!(parsed.address, original.address);
        assert_eq!(parsed.server_public_key, original.server_public_key);
        assert_eq!(parsed.endpoint, original.endpoint);
        assert_eq!(parsed.allowed_ips, original.allowed_ips);
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_tolerates_comments_and_case() {
        let text = "# generated\n[interface]\nprivatekey = abc\naddress = 10.8.0.9/32\nMTU = 1420\n\n; peer follows\n[PEER]\npublickey = def\nendpoint = 1.2.3.4:51820\nallowedips = 10.0.0.0/8\n";
        let parsed: ClientConfig = text.parse().expect("parse");
        assert_eq!(parsed.address, Ipv4Addr::new(10, 8, 0, 9));
        assert!(parsed.dns.is_empty());
        assert_eq!(parsed.persistent_keepalive, 0);
    }

    #[test]
    fn parse_reports_missing_fields() {
        let text = "[Interface]\nPrivateKey = abc\nAddress = 10.8.0.2/32\n[Peer]\nPublicKey = def\nAllowedIPs = 0.0.0.0/0\n";
        assert_eq!(
            text.parse::<ClientConfig>(),
            Err(ConfigParseError::MissingField {
                section: "Peer",
                field: "Endpoint"
            })
        );
        assert_eq!(
            "[Interface]\nPrivateKey = abc\n".parse::<ClientConfig>(),
            Err(ConfigParseError::MissingSection("Peer"))
        );
    }
}
