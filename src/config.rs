//! Configuration file parsing.
//!
//! The file is a sequence of blocks. Every block starts with a `name:` line
//! and runs until the next `name:` line or end of file. Lines are
//! `option: value` pairs; blank lines and lines whose first non-whitespace
//! character is `#` are ignored. One block must be named `self` and describes
//! the local host; every other block describes a peer:
//!
//! ```text
//! name: self
//! id: 014a72b1
//! ip: 192.168.1.10
//! port: 4433
//!
//! name: backup-site
//! id: a3901c00
//! key: <64 hex digits>
//! ip: 192.168.1.20
//! port: 4433
//! max_size: 1400
//! channel: 6610 /var/run/cryptocomms/backup
//! channel: 6611 /var/run/cryptocomms/logs
//! ```
//!
//! `key` and `channel` are forbidden for `self`; `channel` is the only
//! repeatable option. Errors carry the 1-based line number they arose on.
//! Buffers that held key material in hex form are zeroed after parsing.

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::ids::{ChannelId, HostId};
use crate::secret_key::SecretKey;

const SELF_NAME: &str = "self";

/// Largest possible UDP payload over IPv4.
const MAX_UDP_PAYLOAD: i64 = 65507;

#[derive(Debug)]
pub struct ChannelSpec {
    pub id: ChannelId,
    /// Base path of the channel's FIFO pair (`_OUTWARD` / `_INWARD` appended).
    pub fifo_base_path: String,
}

#[derive(Debug)]
pub struct PeerConfig {
    pub name: String,
    pub id: HostId,
    pub key: SecretKey,
    pub channels: Vec<ChannelSpec>,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub max_packet_size: Option<usize>,
}

#[derive(Debug)]
pub struct SelfConfig {
    pub id: HostId,
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Default maximum packet size for peers that do not set their own.
    pub max_packet_size: Option<usize>,
}

#[derive(Debug)]
pub struct Config {
    pub self_config: SelfConfig,
    pub peers: Vec<PeerConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let mut content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("could not read config file {}: {}", path.display(), e))
        })?;

        let parsed = Self::parse(&content);
        content.zeroize();
        parsed
    }

    pub fn parse(content: &str) -> Result<Config> {
        let mut blocks: Vec<Vec<(usize, String, String)>> = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line_num = idx + 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (option, value) = split_option_line(line, line_num)?;
            if option == "name" {
                blocks.push(vec![(line_num, option, value)]);
            } else {
                match blocks.last_mut() {
                    Some(block) => block.push((line_num, option, value)),
                    None => return Err(line_error("expected option \"name\"", line_num)),
                }
            }
        }

        let mut names_seen: HashSet<String> = HashSet::new();
        let mut self_config = None;
        let mut peers = Vec::new();

        for entries in blocks {
            let block = parse_block(entries)?;

            if !names_seen.insert(block.name.clone()) {
                return Err(Error::Config(format!(
                    "multiple configurations for \"{}\"",
                    block.name
                )));
            }

            if block.name == SELF_NAME {
                self_config = Some(SelfConfig {
                    id: block.id.expect("checked by required-option validation"),
                    ip: block.ip.expect("checked by required-option validation"),
                    port: block.port.expect("checked by required-option validation"),
                    max_packet_size: block.max_packet_size,
                });
            } else {
                peers.push(PeerConfig {
                    id: block.id.expect("checked by required-option validation"),
                    key: block.key.expect("checked by required-option validation"),
                    channels: block.channels,
                    ip: block.ip.expect("checked by required-option validation"),
                    port: block.port.expect("checked by required-option validation"),
                    max_packet_size: block.max_packet_size,
                    name: block.name,
                });
            }
        }

        let self_config = self_config.ok_or_else(|| {
            Error::Config(format!("missing configuration for \"{}\"", SELF_NAME))
        })?;

        Ok(Config { self_config, peers })
    }
}

#[derive(Default)]
struct ParsedBlock {
    name: String,
    id: Option<HostId>,
    key: Option<SecretKey>,
    channels: Vec<ChannelSpec>,
    ip: Option<Ipv4Addr>,
    port: Option<u16>,
    max_packet_size: Option<usize>,
}

fn line_error(msg: &str, line_num: usize) -> Error {
    Error::Config(format!("[line {}] {}", line_num, msg))
}

/// Splits an `option: value` line at the first colon, trimming both parts.
fn split_option_line(line: &str, line_num: usize) -> Result<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| line_error("no ':' in line", line_num))?;

    let option = line[..colon].trim();
    if option.is_empty() {
        return Err(line_error("empty option field", line_num));
    }

    Ok((option.to_string(), line[colon + 1..].trim().to_string()))
}

fn parse_block(entries: Vec<(usize, String, String)>) -> Result<ParsedBlock> {
    let mut block = ParsedBlock::default();
    let mut options_seen: HashSet<String> = HashSet::new();

    for (line_num, option, mut value) in entries {
        if options_seen.contains(&option) && option != "channel" {
            value.zeroize();
            return Err(line_error(
                &format!("configuration option \"{}\" repeated", option),
                line_num,
            ));
        }

        let applied = apply_option(&mut block, &option, &value);
        value.zeroize();
        applied.map_err(|msg| line_error(&msg, line_num))?;

        options_seen.insert(option);
    }

    let required: &[&str] = if block.name == SELF_NAME {
        &["id", "ip", "port"]
    } else {
        &["id", "ip", "port", "key"]
    };
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|option| !options_seen.contains(*option))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Config(format!(
            "missing options for \"{}\": {}",
            block.name,
            missing.join(" ")
        )));
    }

    let mut channel_ids = HashSet::new();
    let mut channel_paths = HashSet::new();
    for channel in &block.channels {
        if !channel_ids.insert(channel.id) {
            return Err(Error::Config(format!(
                "duplicated channel id for \"{}\"",
                block.name
            )));
        }
        if !channel_paths.insert(channel.fifo_base_path.clone()) {
            return Err(Error::Config(format!(
                "duplicated channel path for \"{}\"",
                block.name
            )));
        }
    }

    Ok(block)
}

fn apply_option(
    block: &mut ParsedBlock,
    option: &str,
    value: &str,
) -> std::result::Result<(), String> {
    let is_self = block.name == SELF_NAME;

    match option {
        "name" => block.name = parse_name(value)?,
        "id" => {
            block.id = Some(
                HostId::from_hex(value).map_err(|e| format!("error parsing id, {}", e))?,
            )
        }
        "key" if is_self => return Err(format!("\"key\" not allowed for \"{}\"", SELF_NAME)),
        "key" => {
            block.key =
                Some(SecretKey::from_hex(value).map_err(|e| format!("error parsing key, {}", e))?)
        }
        "channel" if is_self => {
            return Err(format!("\"channel\" not allowed for \"{}\"", SELF_NAME))
        }
        "channel" => block.channels.push(parse_channel(value)?),
        "ip" => block.ip = Some(parse_ipv4(value)?),
        "port" => {
            block.port = Some(
                parse_integer(value, 0, u16::MAX as i64)
                    .map_err(|e| format!("invalid port number, {}", e))? as u16,
            )
        }
        "max_size" => {
            block.max_packet_size = Some(
                parse_integer(value, 0, MAX_UDP_PAYLOAD)
                    .map_err(|e| format!("invalid max_size, {}", e))? as usize,
            )
        }
        other => return Err(format!("invalid option name \"{}\"", other)),
    }
    Ok(())
}

fn parse_name(value: &str) -> std::result::Result<String, String> {
    let allowed =
        |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !value.chars().all(allowed) {
        return Err(format!("invalid characters in name: {}", value));
    }
    Ok(value.to_string())
}

/// A channel line is a 4-hex-digit channel id, whitespace, then the FIFO base
/// path (which may itself contain whitespace).
fn parse_channel(value: &str) -> std::result::Result<ChannelSpec, String> {
    let split_at = value
        .find(char::is_whitespace)
        .ok_or("no whitespace in channel specifier")?;
    let (id_part, rest) = value.split_at(split_at);

    let path = rest.trim_start();
    if path.is_empty() {
        return Err("no path in channel specifier".to_string());
    }

    let id = ChannelId::from_hex(id_part)
        .map_err(|e| format!("error parsing channel id, {}", e))?;

    Ok(ChannelSpec {
        id,
        fifo_base_path: path.to_string(),
    })
}

fn parse_ipv4(value: &str) -> std::result::Result<Ipv4Addr, String> {
    if !value.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err("illegal character in ip address".to_string());
    }
    if value.matches('.').count() != 3 {
        return Err("malformed ip address".to_string());
    }

    let mut octets = [0u8; 4];
    for (i, chunk) in value.split('.').enumerate() {
        if chunk.is_empty() || chunk.len() > 3 {
            return Err("malformed ip address".to_string());
        }
        let octet: u32 = chunk.parse().map_err(|_| "malformed ip address".to_string())?;
        if octet > 255 {
            return Err("invalid ip address".to_string());
        }
        octets[i] = octet as u8;
    }

    Ok(Ipv4Addr::from(octets))
}

fn parse_integer(
    value: &str,
    least: i64,
    greatest: i64,
) -> std::result::Result<i64, String> {
    let parsed: i64 = value.parse().map_err(|_| "invalid number".to_string())?;
    if parsed < least || parsed > greatest {
        return Err(format!(
            "number out of range, allowed range is ({},{})",
            least, greatest
        ));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KEY_HEX: &str = "00010a0aa0a0ffff00010203c1c2c3f0fafbfc01234567890abcdef0abcdef00";

    fn valid_config() -> String {
        format!(
            "# local host\n\
             name: self\n\
             id: 014a72b1\n\
             ip: 192.168.1.10\n\
             port: 4433\n\
             \n\
             name: backup-site\n\
             id: a3901c00\n\
             key: {}\n\
             ip: 192.168.1.20\n\
             port: 4434\n\
             max_size: 1400\n\
             channel: 6610 /var/run/cryptocomms/backup\n\
             channel: 6611 /var/run/cryptocomms/with space\n",
            KEY_HEX
        )
    }

    #[test]
    fn test_valid_config() {
        let config = Config::parse(&valid_config()).unwrap();

        assert_eq!(
            config.self_config.id,
            HostId::from_bytes([0x01, 0x4a, 0x72, 0xb1])
        );
        assert_eq!(config.self_config.ip, Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(config.self_config.port, 4433);
        assert_eq!(config.self_config.max_packet_size, None);

        assert_eq!(config.peers.len(), 1);
        let peer = &config.peers[0];
        assert_eq!(peer.name, "backup-site");
        assert_eq!(peer.id, HostId::from_bytes([0xa3, 0x90, 0x1c, 0x00]));
        assert_eq!(peer.key.bytes()[0], 0x00);
        assert_eq!(peer.key.bytes()[7], 0xff);
        assert_eq!(peer.ip, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(peer.port, 4434);
        assert_eq!(peer.max_packet_size, Some(1400));

        assert_eq!(peer.channels.len(), 2);
        assert_eq!(peer.channels[0].id, ChannelId::from_bytes([0x66, 0x10]));
        assert_eq!(peer.channels[0].fifo_base_path, "/var/run/cryptocomms/backup");
        // channel paths may contain whitespace
        assert_eq!(peer.channels[1].fifo_base_path, "/var/run/cryptocomms/with space");
    }

    #[rstest]
    #[case::id_hex_wrong_length("id: 014a72", "has length")]
    #[case::id_hex_invalid_characters("id: 014a72g1", "hex digit")]
    #[case::port_invalid("port: 44x33", "invalid number")]
    #[case::port_out_of_range("port: 70000", "out of range")]
    #[case::port_negative("port: -1", "out of range")]
    #[case::max_size_out_of_range("max_size: 65508", "out of range")]
    #[case::ip_illegal_character("ip: 192.168.one.1", "illegal character in ip address")]
    #[case::ip_too_few_dots("ip: 192.168.1", "malformed ip address")]
    #[case::ip_too_many_dots("ip: 192.168.1.1.1", "malformed ip address")]
    #[case::ip_empty_segment("ip: 192..1.1", "malformed ip address")]
    #[case::ip_trailing_dot("ip: 192.168.1.", "malformed ip address")]
    #[case::ip_long_segment("ip: 1921.68.1.1", "malformed ip address")]
    #[case::ip_segment_too_big("ip: 192.168.1.256", "invalid ip address")]
    #[case::no_colon("port 4433", "no ':' in line")]
    #[case::empty_option_field(": 4433", "empty option field")]
    #[case::invalid_option("color: blue", "invalid option name")]
    fn test_self_block_line_errors(#[case] bad_line: &str, #[case] expected_msg: &str) {
        let content = format!("name: self\nid: 014a72b1\n{}\nport: 4433\nip: 1.2.3.4\n", bad_line);
        let err = Config::parse(&content).unwrap_err();
        let rendered = err.to_string();
        assert!(
            rendered.contains(expected_msg),
            "expected \"{}\" in \"{}\"",
            expected_msg,
            rendered
        );
    }

    #[rstest]
    #[case::key_wrong_length("key: 0102", "has length")]
    #[case::name_invalid_characters("name: bad name!", "invalid characters in name")]
    #[case::channel_no_whitespace("channel: 6610/no/space", "no whitespace in channel specifier")]
    #[case::channel_bad_id("channel: 66zz /some/path", "error parsing channel id")]
    fn test_peer_block_line_errors(#[case] bad_line: &str, #[case] expected_msg: &str) {
        let content = format!(
            "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\n\
             name: peer-a\nid: a3901c00\nkey: {}\nip: 1.2.3.5\nport: 4433\n{}\n",
            KEY_HEX, bad_line
        );
        let err = Config::parse(&content).unwrap_err();
        let rendered = err.to_string();
        assert!(
            rendered.contains(expected_msg),
            "expected \"{}\" in \"{}\"",
            expected_msg,
            rendered
        );
    }

    #[test]
    fn test_error_carries_line_number() {
        let content = "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: port\n";
        let err = Config::parse(content).unwrap_err();
        assert!(err.to_string().contains("[line 4]"));
    }

    #[test]
    fn test_key_forbidden_for_self() {
        let content = format!(
            "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\nkey: {}\n",
            KEY_HEX
        );
        let err = Config::parse(&content).unwrap_err();
        assert!(err.to_string().contains("\"key\" not allowed"));
    }

    #[test]
    fn test_channel_forbidden_for_self() {
        let content =
            "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\nchannel: 6610 /some/path\n";
        let err = Config::parse(content).unwrap_err();
        assert!(err.to_string().contains("\"channel\" not allowed"));
    }

    #[test]
    fn test_first_option_must_be_name() {
        let content = "id: 014a72b1\nname: self\nip: 1.2.3.4\nport: 4433\n";
        let err = Config::parse(content).unwrap_err();
        assert!(err.to_string().contains("expected option \"name\""));
    }

    #[test]
    fn test_repeated_option_rejected() {
        let content = "name: self\nid: 014a72b1\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\n";
        let err = Config::parse(content).unwrap_err();
        assert!(err.to_string().contains("\"id\" repeated"));
    }

    #[test]
    fn test_missing_required_option() {
        let content = "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\n\
                       name: peer-a\nid: a3901c00\nip: 1.2.3.5\nport: 4433\n";
        let err = Config::parse(content).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("missing options for \"peer-a\""));
        assert!(rendered.contains("key"));
    }

    #[test]
    fn test_missing_self_block() {
        let content = format!(
            "name: peer-a\nid: a3901c00\nkey: {}\nip: 1.2.3.5\nport: 4433\n",
            KEY_HEX
        );
        let err = Config::parse(&content).unwrap_err();
        assert!(err.to_string().contains("missing configuration for \"self\""));
    }

    #[test]
    fn test_duplicate_block_names() {
        let content = format!(
            "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\n\
             name: peer-a\nid: a3901c00\nkey: {0}\nip: 1.2.3.5\nport: 4433\n\
             name: peer-a\nid: a3901c01\nkey: {0}\nip: 1.2.3.6\nport: 4433\n",
            KEY_HEX
        );
        let err = Config::parse(&content).unwrap_err();
        assert!(err.to_string().contains("multiple configurations for \"peer-a\""));
    }

    #[rstest]
    #[case::same_id("channel: 6610 /path/one\nchannel: 6610 /path/two", "duplicated channel id")]
    #[case::same_path("channel: 6610 /path/one\nchannel: 6611 /path/one", "duplicated channel path")]
    fn test_duplicate_channels_rejected(#[case] channels: &str, #[case] expected_msg: &str) {
        let content = format!(
            "name: self\nid: 014a72b1\nip: 1.2.3.4\nport: 4433\n\
             name: peer-a\nid: a3901c00\nkey: {}\nip: 1.2.3.5\nport: 4433\n{}\n",
            KEY_HEX, channels
        );
        let err = Config::parse(&content).unwrap_err();
        assert!(err.to_string().contains(expected_msg));
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() {
        let content = "\n   # a comment\nname: self\n# another\nid: 014a72b1\n\nip: 1.2.3.4\nport: 4433\n";
        let config = Config::parse(content).unwrap();
        assert_eq!(config.self_config.port, 4433);
        assert!(config.peers.is_empty());
    }
}
