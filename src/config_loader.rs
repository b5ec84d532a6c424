use log::warn;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

// ---------- Data structures ----------

/// Everything the server reads from the environment, captured once at
/// startup. The core never consults the environment again.
#[derive(Clone, Debug)]
pub struct Config {
    pub ip: String,
    pub port: String,
    pub status: StatusConfig,
    pub login: LoginConfig,
    /// Bind address for the Prometheus exporter; empty disables it.
    pub metrics_bind_address: String,
}

/// Parameters of the Status sub-protocol response.
#[derive(Clone, Debug, Default)]
pub struct StatusConfig {
    pub version_name: String,
    pub protocol: i32,
    pub motd: String,
    pub max_players: i32,
    pub online_players: i32,
}

/// Parameters of the Login sub-protocol and the proxy gate.
#[derive(Clone, Debug, Default)]
pub struct LoginConfig {
    pub error_message: String,
    /// Optional title shown above the error body; empty keeps the plain
    /// chat-component form.
    pub error_title: String,
    pub error_delay: Duration,
    pub force_connection_lost_title: bool,
    /// Backend address for whitelisted players; empty disables proxying.
    pub real_server_addr: String,
    pub whitelist: HashSet<String>,
    /// Voice chat UDP relay addresses; either one empty disables the relay.
    pub voicechat_listen_addr: String,
    pub voicechat_backend_addr: String,
}

impl Config {
    pub fn from_env() -> Config {
        let version_name = env_or("VERSION_NAME", "1.20.1");
        let protocol = match env_or("PROTOCOL", "").trim().parse::<i32>() {
            Ok(protocol) => protocol,
            Err(_) => protocol_for_version(&version_name),
        };

        let status = StatusConfig {
            protocol,
            version_name,
            motd: decode_escapes(&env_or("MOTD", "A Minecraft Server")),
            max_players: env_i32("MAX_PLAYERS", 20),
            online_players: env_i32("ONLINE_PLAYERS", 0),
        };

        let login = LoginConfig {
            error_message: decode_escapes(&env_or("ERROR", "Server is under maintenance")),
            error_title: decode_escapes(&env_or("ERROR_TITLE", "")),
            error_delay: parse_error_delay(&env_or("ERROR_DELAY_SECONDS", "")),
            force_connection_lost_title: parse_bool(&env_or("FORCE_CONNECTION_LOST_TITLE", "")),
            real_server_addr: env_or("REAL_SERVER_ADDR", ""),
            whitelist: parse_whitelist(&env_or("WHITELIST", "")),
            voicechat_listen_addr: env_or("SIMPLE_VOICECHAT_LISTEN_ADDR", ""),
            voicechat_backend_addr: env_or("SIMPLE_VOICECHAT_BACKEND_ADDR", ""),
        };

        Config {
            ip: env_or("IP", "0.0.0.0"),
            port: env_or("PORT", "25565"),
            status,
            login,
            metrics_bind_address: env_or("METRICS_BIND_ADDRESS", ""),
        }
    }

    /// Listen address in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl LoginConfig {
    /// Username check against the configured whitelist, ignoring ASCII case.
    pub fn is_whitelisted(&self, username: &str) -> bool {
        self.whitelist.contains(&username.to_ascii_lowercase())
    }
}

// ---------- Environment helpers ----------

fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_i32(key: &str, default: i32) -> i32 {
    let raw = env_or(key, "");
    if raw.is_empty() {
        return default;
    }
    match raw.trim().parse::<i32>() {
        Ok(value) => value,
        Err(_) => {
            warn!("Invalid {} value {:?}, using {}", key, raw, default);
            default
        }
    }
}

fn parse_error_delay(raw: &str) -> Duration {
    match raw.trim().parse::<i64>() {
        Ok(seconds) if seconds >= 0 => Duration::from_secs(seconds as u64),
        _ => Duration::ZERO,
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

fn parse_whitelist(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

// ---------- Version table ----------

const FALLBACK_PROTOCOL: i32 = 763; // 1.20/1.20.1

/// Maps a Minecraft version name to its protocol number. Unknown versions
/// fall back to the 1.20.1 protocol the mock targets.
pub fn protocol_for_version(version_name: &str) -> i32 {
    match version_name.trim() {
        "1.8" | "1.8.9" => 47,
        "1.12.2" => 340,
        "1.16.4" | "1.16.5" => 754,
        "1.17.1" => 756,
        "1.18.2" => 758,
        "1.19.2" => 760,
        "1.19.4" => 762,
        "1.20" | "1.20.1" => 763,
        "1.20.2" => 764,
        "1.20.3" | "1.20.4" => 765,
        "1.20.5" | "1.20.6" => 766,
        "1.21" | "1.21.1" => 767,
        "1.21.2" | "1.21.3" => 768,
        "1.21.4" => 769,
        _ => FALLBACK_PROTOCOL,
    }
}

// ---------- server.properties-style unescaping ----------

/// Decodes `\uXXXX` sequences and the common backslash escapes that
/// server.properties values carry, so operators can paste formatted MOTD
/// and error strings straight from a properties file. Malformed escapes
/// are kept literally.
pub fn decode_escapes(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '\\' || i + 1 >= chars.len() {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        match chars[i + 1] {
            'n' => {
                out.push('\n');
                i += 2;
            }
            'r' => {
                out.push('\r');
                i += 2;
            }
            't' => {
                out.push('\t');
                i += 2;
            }
            '\\' => {
                out.push('\\');
                i += 2;
            }
            'u' => match decode_unicode_escape(&chars, i) {
                Some((ch, consumed)) => {
                    out.push(ch);
                    i += consumed;
                }
                None => {
                    out.push('\\');
                    i += 1;
                }
            },
            other => {
                out.push('\\');
                out.push(other);
                i += 2;
            }
        }
    }
    out
}

fn decode_unicode_escape(chars: &[char], start: usize) -> Option<(char, usize)> {
    let high = parse_hex4(chars, start + 2)?;
    if (0xD800..=0xDBFF).contains(&high) {
        // UTF-16 surrogate pair: a low surrogate escape must follow.
        if chars.get(start + 6) == Some(&'\\') && chars.get(start + 7) == Some(&'u') {
            let low = parse_hex4(chars, start + 8)?;
            if (0xDC00..=0xDFFF).contains(&low) {
                let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                return char::from_u32(combined).map(|ch| (ch, 12));
            }
        }
        return None;
    }
    char::from_u32(high).map(|ch| (ch, 6))
}

fn parse_hex4(chars: &[char], start: usize) -> Option<u32> {
    if start + 4 > chars.len() {
        return None;
    }
    let mut value = 0u32;
    for &ch in &chars[start..start + 4] {
        value = value * 16 + ch.to_digit(16)?;
    }
    Some(value)
}

// ---------- Tests ----------
