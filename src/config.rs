use crate::whitelist::{Cidr, NatRule, Whitelist};
use anyhow::{bail, Context};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mail/smfs/smf-spf.conf";
pub const DEFAULT_REJECT_REASON: &str =
    "Message was rejected during SPF policy evaluation. sender:%1$s client-ip:%2$s";

const MAX_CIDR_ENTRIES: usize = 10_000;

/// Longest accepted cache TTL, ten years.
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 86_400;

/// Immutable policy snapshot, loaded once before the milter starts serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub socket: String,
    pub user: String,
    pub daemonize: bool,
    pub log_to: Option<PathBuf>,
    pub syslog_facility: String,
    pub authserv_id: Option<String>,
    pub fixed_client_ip: Option<IpAddr>,
    pub whitelist: Whitelist,
    pub tag: String,
    pub tag_subject: bool,
    pub add_header: bool,
    pub add_received_header: bool,
    pub quarantine: bool,
    pub quarantine_box: String,
    pub refuse_fail: bool,
    pub refuse_none: bool,
    pub refuse_none_helo: bool,
    pub soft_fail: bool,
    pub accept_temperror: bool,
    pub relaxed_local_part: bool,
    pub skip_auth: bool,
    pub skip_ndr: bool,
    /// `spfbestguess`, recorded only. Evaluation never falls back to a
    /// guessed record.
    pub best_guess: bool,
    pub ttl_seconds: u64,
    pub reject_reason: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: "unix:/var/run/smfs/smf-spf.sock".to_string(),
            user: "smfs".to_string(),
            daemonize: true,
            log_to: None,
            syslog_facility: "mail".to_string(),
            authserv_id: None,
            fixed_client_ip: None,
            whitelist: Whitelist::default(),
            tag: "[SPF:fail]".to_string(),
            tag_subject: true,
            add_header: true,
            add_received_header: false,
            quarantine: false,
            quarantine_box: "postmaster".to_string(),
            refuse_fail: true,
            refuse_none: false,
            refuse_none_helo: false,
            soft_fail: false,
            accept_temperror: true,
            relaxed_local_part: false,
            skip_auth: true,
            skip_ndr: false,
            best_guess: true,
            ttl_seconds: 3600,
            reject_reason: DEFAULT_REJECT_REASON.to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Load `path`, falling back to the built-in defaults when it does not
    /// exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "Configuration file '{}' not found, using default configuration",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Parse `key value` lines on top of the defaults.
    ///
    /// Unknown keys and unusable values are skipped so that a typo never
    /// prevents the daemon from starting.
    pub fn parse(content: &str) -> Self {
        let mut config = Config::default();
        for (number, line) in content.lines().enumerate() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            let Some((key, value)) = line.split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            config.apply(&key.to_ascii_lowercase(), value, number + 1);
        }
        config
    }

    fn apply(&mut self, key: &str, value: &str, line: usize) {
        match key {
            "whitelistip" => {
                if self.whitelist.cidrs.len() >= MAX_CIDR_ENTRIES {
                    log::error!("Too many CIDR entries (>{MAX_CIDR_ENTRIES}), skipping {value}");
                    return;
                }
                match value.parse::<Cidr>() {
                    Ok(cidr) => self.whitelist.add_cidr(cidr),
                    Err(e) => log::warn!("Line {line}: ignoring whitelistip: {e}"),
                }
            }
            "clientipnat" => match value.parse::<NatRule>() {
                Ok(rule) => self.whitelist.add_nat(rule),
                Err(e) => log::warn!("Line {line}: ignoring clientipnat: {e}"),
            },
            "whitelistptr" => self.whitelist.add_ptr(value),
            "whitelistfrom" => self.whitelist.add_from(value),
            "whitelistto" => self.whitelist.add_to(value),
            "tag" => self.tag = value.to_string(),
            "quarantinebox" => self.quarantine_box = value.to_string(),
            "rejectreason" => self.reject_reason = value.to_string(),
            "authservid" => self.authserv_id = Some(value.to_string()),
            "user" => self.user = value.to_string(),
            "socket" => self.socket = value.to_string(),
            "logto" => self.log_to = Some(PathBuf::from(value)),
            "syslog" => self.syslog_facility = value.to_ascii_lowercase(),
            "fixedclientip" => match value.parse::<IpAddr>() {
                Ok(ip) => self.fixed_client_ip = Some(ip),
                Err(_) => log::warn!("Line {line}: ignoring invalid fixedclientip {value}"),
            },
            "ttl" => match parse_ttl(value) {
                Some(ttl) if ttl > MAX_TTL_SECONDS => {
                    log::warn!("Line {line}: ignoring ttl {value}, limit is {MAX_TTL_SECONDS}s");
                }
                Some(ttl) => {
                    if ttl < 60 {
                        log::warn!("TTL {ttl} is very low, consider >= 60s");
                    }
                    if ttl > 86_400 {
                        log::warn!("TTL {ttl} is very high, consider <= 86400s (24h)");
                    }
                    self.ttl_seconds = ttl;
                }
                None => log::warn!("Line {line}: ignoring invalid ttl {value}"),
            },
            _ => {
                let Some(flag) = self.flag_mut(key) else {
                    log::debug!("Line {line}: ignoring unknown key {key}");
                    return;
                };
                match parse_switch(value) {
                    Some(on) => *flag = on,
                    None => log::warn!("Line {line}: {key} expects on or off, got {value}"),
                }
            }
        }
    }

    fn flag_mut(&mut self, key: &str) -> Option<&mut bool> {
        let flag = match key {
            "tagsubject" => &mut self.tag_subject,
            "addheader" => &mut self.add_header,
            "addreceivedheader" => &mut self.add_received_header,
            "quarantine" => &mut self.quarantine,
            "refusefail" => &mut self.refuse_fail,
            "refusespfnone" => &mut self.refuse_none,
            "refusespfnonehelo" => &mut self.refuse_none_helo,
            "softfail" => &mut self.soft_fail,
            "accepttemperror" => &mut self.accept_temperror,
            "relaxedlocalpart" => &mut self.relaxed_local_part,
            "skipauth" => &mut self.skip_auth,
            "skipndr" => &mut self.skip_ndr,
            "spfbestguess" => &mut self.best_guess,
            "daemonize" => &mut self.daemonize,
            _ => return None,
        };
        Some(flag)
    }

    /// Zero disables the result cache.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn listen_addr(&self) -> anyhow::Result<ListenAddr> {
        ListenAddr::parse(&self.socket)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// `N`, `Nm`, `Nh` or `Nd`, in seconds.
pub fn parse_ttl(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last()? {
        (i, 'm' | 'M') => (&value[..i], 60),
        (i, 'h' | 'H') => (&value[..i], 3600),
        (i, 'd' | 'D') => (&value[..i], 86_400),
        _ => (value, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(unit)
}

fn parse_switch(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on") {
        Some(true)
    } else if value.eq_ignore_ascii_case("off") {
        Some(false)
    } else {
        None
    }
}

/// Where the milter listens for MTA connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Inet(SocketAddr),
}

impl ListenAddr {
    /// Accepts sendmail-style specs: `unix:/path`, `local:/path`,
    /// `inet:port@host`, `inet6:port@host`, or a bare path.
    pub fn parse(spec: &str) -> anyhow::Result<Self> {
        if let Some(path) = spec
            .strip_prefix("unix:")
            .or_else(|| spec.strip_prefix("local:"))
        {
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }

        let inet = spec
            .strip_prefix("inet:")
            .map(|rest| (rest, "0.0.0.0"))
            .or_else(|| spec.strip_prefix("inet6:").map(|rest| (rest, "::")));
        if let Some((rest, any)) = inet {
            let (port, host) = rest.split_once('@').unwrap_or((rest, any));
            let port: u16 = port
                .parse()
                .with_context(|| format!("Invalid port in socket {spec}"))?;
            let host: IpAddr = host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse()
                .with_context(|| format!("Invalid host in socket {spec}"))?;
            return Ok(ListenAddr::Inet(SocketAddr::new(host, port)));
        }

        if spec.starts_with('/') {
            return Ok(ListenAddr::Unix(PathBuf::from(spec)));
        }
        bail!("Unsupported socket specification {spec}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tag, "[SPF:fail]");
        assert_eq!(config.quarantine_box, "postmaster");
        assert_eq!(config.ttl(), Duration::from_secs(3600));
        assert!(config.refuse_fail);
        assert!(config.tag_subject);
        assert!(config.add_header);
        assert!(!config.add_received_header);
        assert!(!config.quarantine);
        assert!(config.accept_temperror);
        assert!(config.skip_auth);
        assert!(!config.skip_ndr);
        assert_eq!(config.reject_reason, DEFAULT_REJECT_REASON);
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::parse(
            "# smf-spf configuration\n\
             WhitelistIP 127.0.0.1\n\
             whitelistip 10.0.0.0/8   # internal\n\
             whitelistptr .example.com\n\
             whitelistfrom Friend@Example.org\n\
             whitelistto postmaster@\n\
             clientipnat 192.168.1.10:203.0.113.10\n\
             tag [SPF:bad]\n\
             tagsubject off\n\
             addheader off\n\
             addreceivedheader on\n\
             quarantine on\n\
             quarantinebox spambox@example.com\n\
             refusefail off\n\
             refusespfnone on\n\
             refusespfnonehelo on\n\
             softfail on\n\
             accepttemperror off\n\
             relaxedlocalpart on\n\
             skipauth off\n\
             skipndr on\n\
             ttl 30m\n\
             rejectreason Go away %1$s from %2$s\n\
             authservid mx.example.net\n\
             fixedclientip 198.51.100.7\n\
             socket inet:8890@127.0.0.1\n\
             user nobody\n\
             daemonize off\n",
        );

        assert_eq!(config.whitelist.cidrs.len(), 2);
        assert_eq!(config.whitelist.ptrs, vec![".example.com".to_string()]);
        assert_eq!(config.whitelist.froms, vec!["friend@example.org".to_string()]);
        assert_eq!(config.whitelist.tos, vec!["postmaster@".to_string()]);
        assert_eq!(config.whitelist.nats.len(), 1);
        assert_eq!(config.tag, "[SPF:bad]");
        assert!(!config.tag_subject);
        assert!(!config.add_header);
        assert!(config.add_received_header);
        assert!(config.quarantine);
        assert_eq!(config.quarantine_box, "spambox@example.com");
        assert!(!config.refuse_fail);
        assert!(config.refuse_none);
        assert!(config.refuse_none_helo);
        assert!(config.soft_fail);
        assert!(!config.accept_temperror);
        assert!(config.relaxed_local_part);
        assert!(!config.skip_auth);
        assert!(config.skip_ndr);
        assert_eq!(config.ttl_seconds, 1800);
        assert_eq!(config.reject_reason, "Go away %1$s from %2$s");
        assert_eq!(config.authserv_id.as_deref(), Some("mx.example.net"));
        assert_eq!(config.fixed_client_ip, Some("198.51.100.7".parse().unwrap()));
        assert_eq!(config.user, "nobody");
        assert!(!config.daemonize);
        assert_eq!(
            config.listen_addr().unwrap(),
            ListenAddr::Inet("127.0.0.1:8890".parse().unwrap())
        );
    }

    #[test]
    fn test_last_scalar_wins_and_lists_accumulate() {
        let config = Config::parse(
            "tag first\ntag second\nquarantine on\nquarantine off\n\
             whitelistfrom a.example\nwhitelistfrom b.example\n",
        );
        assert_eq!(config.tag, "second");
        assert!(!config.quarantine);
        assert_eq!(config.whitelist.froms.len(), 2);
    }

    #[test]
    fn test_bad_values_are_skipped() {
        let config = Config::parse(
            "whitelistip not-an-ip\n\
             clientipnat 10.0.0.1\n\
             ttl soon\n\
             refusefail maybe\n\
             frobnicate on\n\
             tag\n",
        );
        assert!(config.whitelist.cidrs.is_empty());
        assert!(config.whitelist.nats.is_empty());
        assert_eq!(config.ttl_seconds, 3600);
        assert!(config.refuse_fail);
        assert_eq!(config.tag, "[SPF:fail]");
    }

    #[test]
    fn test_cidr_limit() {
        let content: String = (0..MAX_CIDR_ENTRIES + 5)
            .map(|i| format!("whitelistip 10.{}.{}.0/24\n", i / 256, i % 256))
            .collect();
        let config = Config::parse(&content);
        assert_eq!(config.whitelist.cidrs.len(), MAX_CIDR_ENTRIES);
    }

    #[test]
    fn test_best_guess_is_recorded() {
        assert!(Config::default().best_guess);
        assert!(!Config::parse("spfbestguess off\n").best_guess);
    }

    #[test]
    fn test_oversized_ttl_is_skipped() {
        let config = Config::parse("ttl 18446744073709551615\n");
        assert_eq!(config.ttl_seconds, 3600);

        let config = Config::parse("ttl 3651d\n");
        assert_eq!(config.ttl_seconds, 3600);

        let config = Config::parse("ttl 3650d\n");
        assert_eq!(config.ttl_seconds, MAX_TTL_SECONDS);
        let cache = crate::cache::ResultCache::with_buckets(config.ttl(), 8);
        cache.put("192.0.2.1|example.com", crate::verdict::SpfVerdict::Pass);
        assert_eq!(
            cache.get("192.0.2.1|example.com"),
            Some(crate::verdict::SpfVerdict::Pass)
        );
    }

    #[test]
    fn test_parse_ttl_units() {
        assert_eq!(parse_ttl("90"), Some(90));
        assert_eq!(parse_ttl("5m"), Some(300));
        assert_eq!(parse_ttl("2H"), Some(7200));
        assert_eq!(parse_ttl("1d"), Some(86_400));
        assert_eq!(parse_ttl("0"), Some(0));
        assert_eq!(parse_ttl("m"), None);
        assert_eq!(parse_ttl("abc"), None);
    }

    #[test]
    fn test_listen_addr_specs() {
        assert_eq!(
            ListenAddr::parse("unix:/var/run/smfs/smf-spf.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/var/run/smfs/smf-spf.sock"))
        );
        assert_eq!(
            ListenAddr::parse("local:/tmp/spf.sock").unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/spf.sock"))
        );
        assert_eq!(
            ListenAddr::parse("inet:10025").unwrap(),
            ListenAddr::Inet("0.0.0.0:10025".parse().unwrap())
        );
        assert_eq!(
            ListenAddr::parse("inet6:10025@[::1]").unwrap(),
            ListenAddr::Inet("[::1]:10025".parse().unwrap())
        );
        assert!(ListenAddr::parse("inet:port@localhost").is_err());
        assert!(ListenAddr::parse("tcp:1234").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "whitelistip 192.0.2.0/24").unwrap();
        writeln!(file, "ttl 1h").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.whitelist.cidrs.len(), 1);
        assert_eq!(config.ttl_seconds, 3600);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.conf")).unwrap();
        assert_eq!(config, Config::default());
        assert!(Config::from_file(&dir.path().join("absent.conf")).is_err());
    }

    #[test]
    fn test_yaml_dump() {
        let yaml = Config::default().to_yaml().unwrap();
        assert!(yaml.contains("quarantine_box: postmaster"));
        assert!(yaml.contains("ttl_seconds: 3600"));
    }
}
