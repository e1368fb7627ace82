use crate::address::{self, AddressError};
use crate::annotation::{self, Evaluation};
use crate::cache::ResultCache;
use crate::config::Config;
use crate::oracle::{SpfOracle, SpfRequest};
use crate::verdict::SpfVerdict;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

/// SMTP reply attached to a rejection or temporary failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub extended: String,
    pub message: String,
}

/// What the MTA should do after one session event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Accept,
    Reject(Reply),
    TempFail(Reply),
}

/// Message edit requested at end of message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// Replace the `index`-th (1-based) occurrence of a header.
    ChangeHeader { name: String, index: u32, value: String },
    AddHeader { name: String, value: String },
    DeleteRecipient(String),
    AddRecipient(String),
}

/// Trust signals the MTA attaches to the MAIL command.
#[derive(Debug, Clone, Default)]
pub struct SessionSignals {
    /// SASL login name, when the client authenticated.
    pub authenticated_user: Option<String>,
    /// TLS client certificate verification result (`OK` when trusted).
    pub verified: Option<String>,
}

impl SessionSignals {
    fn tls_verified(&self) -> bool {
        self.verified.as_deref() == Some("OK")
    }
}

/// Process-wide state shared by every session: the policy snapshot, the
/// verdict cache and the SPF oracle.
pub struct PolicyEngine {
    config: Config,
    cache: Option<ResultCache>,
    oracle: Arc<dyn SpfOracle>,
    site: OnceLock<String>,
}

impl PolicyEngine {
    /// A zero TTL in `config` runs without a cache.
    pub fn new(config: Config, oracle: Arc<dyn SpfOracle>) -> Self {
        let cache = (config.ttl_seconds > 0).then(|| ResultCache::new(config.ttl()));
        Self::with_cache(config, oracle, cache)
    }

    pub fn with_cache(config: Config, oracle: Arc<dyn SpfOracle>, cache: Option<ResultCache>) -> Self {
        PolicyEngine {
            config,
            cache,
            oracle,
            site: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> Option<&ResultCache> {
        self.cache.as_ref()
    }

    /// Start evaluating a new SMTP session.
    ///
    /// Returns `None` when the session needs no evaluation at all: no client
    /// address is known, or the client is whitelisted by address or name.
    pub fn connect(
        self: &Arc<Self>,
        client: Option<IpAddr>,
        client_name: &str,
        site_hint: Option<&str>,
    ) -> Option<Transaction> {
        let site = self.site(site_hint);

        let Some(addr) = client else {
            log::debug!("No client address for {client_name}, accepting");
            return None;
        };

        let whitelist = &self.config.whitelist;
        if whitelist.ip_trusted(&addr) || whitelist.ptr_trusted(client_name) {
            log::debug!("Whitelisted client {addr} ({client_name}), accepting");
            return None;
        }

        let client = whitelist.nat_translate(self.config.fixed_client_ip.unwrap_or(addr));
        if client != addr {
            log::debug!("Evaluating {addr} as {client}");
        }

        Some(Transaction {
            engine: Arc::clone(self),
            client,
            client_name: client_name.to_string(),
            site,
            helo: "undefined".to_string(),
            envelope_from: String::new(),
            sender: String::new(),
            null_sender: false,
            verdict: None,
            reason: None,
            quarantined: Vec::new(),
            subject: None,
        })
    }

    /// Release the cache. Called once when the milter stops serving.
    pub fn shutdown(&self) {
        if let Some(cache) = &self.cache {
            log::info!("Releasing {} cached SPF results", cache.len());
            cache.teardown();
        }
    }

    // authservid wins, then the first identity the MTA advertises
    fn site(&self, hint: Option<&str>) -> String {
        if let Some(id) = &self.config.authserv_id {
            return id.clone();
        }
        if let Some(site) = self.site.get() {
            return site.clone();
        }
        match hint.filter(|h| !h.is_empty()) {
            Some(hint) => self.site.get_or_init(|| hint.to_string()).clone(),
            None => "localhost".to_string(),
        }
    }
}

/// Per-session decision state, advanced by one method per milter event.
pub struct Transaction {
    engine: Arc<PolicyEngine>,
    client: IpAddr,
    client_name: String,
    site: String,
    helo: String,
    envelope_from: String,
    sender: String,
    null_sender: bool,
    verdict: Option<SpfVerdict>,
    reason: Option<String>,
    quarantined: Vec<String>,
    subject: Option<String>,
}

impl Transaction {
    /// Client address SPF is evaluated for, after NAT.
    pub fn client(&self) -> IpAddr {
        self.client
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn verdict(&self) -> Option<SpfVerdict> {
        self.verdict
    }

    pub fn helo(&mut self, arg: &str) -> Disposition {
        self.helo = arg.to_string();
        Disposition::Continue
    }

    /// Decide on the envelope sender. Consults the cache and, on a miss, the
    /// oracle; the cache lock is never held across the oracle call.
    pub async fn envelope_from(&mut self, args: &[String], signals: &SessionSignals) -> Disposition {
        let engine = Arc::clone(&self.engine);
        let config = &engine.config;

        if signals.tls_verified() {
            log::debug!("Client certificate verified for {}, accepting", self.client);
            return Disposition::Accept;
        }

        self.reset();
        let raw = args.first().map(String::as_str).unwrap_or_default();
        self.envelope_from = raw.to_string();

        if address::is_null_sender(raw) {
            if config.skip_ndr {
                log::debug!("Null sender from {}, skipping SPF", self.client);
                return Disposition::Accept;
            }
            let helo = self.helo.to_ascii_lowercase();
            let synthetic = format!("<postmaster@{helo}>");
            if helo.is_empty() || address::extract_address(&synthetic, true).is_err() {
                log::info!("Unusable HELO {:?} for null sender from {}", self.helo, self.client);
                return self.refuse("1.7", "Sender address does not conform to RFC-2821 syntax");
            }
            self.null_sender = true;
            self.sender = format!("postmaster@{helo}");
        } else {
            match address::extract_address(raw, config.relaxed_local_part) {
                Ok(sender) => self.sender = sender.to_ascii_lowercase(),
                Err(e) => return self.malformed_sender(raw, e),
            }
        }

        if signals.authenticated_user.is_some() && config.skip_auth {
            log::debug!("Authenticated sender {}, skipping SPF", self.sender);
            return Disposition::Accept;
        }

        if config.whitelist.from_trusted(&self.sender) {
            log::debug!("Whitelisted sender {}, accepting", self.sender);
            return Disposition::Accept;
        }

        let domain = address::domain_of(&self.sender).unwrap_or_default();
        let key = format!("{}|{}", self.client, domain);

        if let Some(verdict) = engine.cache.as_ref().and_then(|cache| cache.get(&key)) {
            log::info!(
                "SPF {} (cached): {}, {}, {}, {}",
                verdict.keyword(),
                self.client,
                self.client_name,
                self.helo,
                self.envelope_from
            );
            return self.apply_verdict(verdict, None);
        }

        let request = SpfRequest {
            client: self.client,
            helo: self.helo.clone(),
            sender: self.sender.clone(),
            receiver: self.site.clone(),
        };
        let answer = engine.oracle.evaluate(&request).await;
        log::info!(
            "SPF {}: {}, {}, {}, {}",
            answer.verdict.keyword(),
            self.client,
            self.client_name,
            self.helo,
            self.envelope_from
        );

        if answer.verdict.is_cacheable() {
            if let Some(cache) = &engine.cache {
                cache.put(&key, answer.verdict);
            }
        }

        self.apply_verdict(answer.verdict, answer.reason)
    }

    pub fn envelope_recipient(&mut self, args: &[String]) -> Disposition {
        let config = &self.engine.config;
        let raw = args.first().map(String::as_str).unwrap_or_default();

        let recipient = match address::extract_address(raw, true) {
            Ok(recipient) => recipient,
            Err(e) => {
                log::info!("Malformed recipient {raw:?} from {}: {e}", self.client);
                return self.refuse("1.3", "Recipient address does not conform to RFC-2821 syntax");
            }
        };

        if config.whitelist.has_recipient_rules() {
            if config.whitelist.to_trusted(&recipient) {
                log::debug!("Whitelisted recipient {recipient}, exempt from SPF");
                return Disposition::Continue;
            }
            if self.verdict == Some(SpfVerdict::Fail) && config.refuse_fail {
                log::info!("Refusing {recipient} for SPF fail from {}", self.sender);
                let reason = self.reject_reason();
                return self.refuse("7.1", &reason);
            }
        }

        if config.quarantine && self.verdict.is_some_and(SpfVerdict::is_failing) {
            self.quarantined.push(raw.to_string());
        }
        Disposition::Continue
    }

    /// Remember the first Subject of a failing message for tagging.
    pub fn header(&mut self, name: &str, value: &str) -> Disposition {
        if self.subject.is_none()
            && self.engine.config.tag_subject
            && self.verdict.is_some_and(SpfVerdict::is_failing)
            && name.eq_ignore_ascii_case("Subject")
        {
            self.subject = Some(value.to_string());
        }
        Disposition::Continue
    }

    pub fn end_of_message(&mut self) -> Vec<Modification> {
        let config = &self.engine.config;
        let mut modifications = Vec::new();
        let Some(verdict) = self.verdict else {
            return modifications;
        };

        if verdict.is_failing() && config.tag_subject {
            let value = annotation::tagged_subject(&config.tag, self.subject.as_deref());
            modifications.push(match self.subject {
                Some(_) => Modification::ChangeHeader {
                    name: "Subject".to_string(),
                    index: 1,
                    value,
                },
                None => Modification::AddHeader {
                    name: "Subject".to_string(),
                    value,
                },
            });
        }

        if config.add_header {
            let client = self.client.to_string();
            let eval = Evaluation {
                site: &self.site,
                verdict,
                reason: self.reason.as_deref(),
                client: &client,
                sender: &self.sender,
                envelope_from: &self.envelope_from,
                helo: &self.helo,
            };
            modifications.push(Modification::AddHeader {
                name: annotation::AUTH_RESULTS_HEADER.to_string(),
                value: annotation::authentication_results(&eval),
            });
            if config.add_received_header {
                modifications.push(Modification::AddHeader {
                    name: annotation::RECEIVED_SPF_HEADER.to_string(),
                    value: annotation::received_spf(&eval),
                });
            }
        }

        if !self.quarantined.is_empty() {
            for recipient in &self.quarantined {
                modifications.push(Modification::DeleteRecipient(recipient.clone()));
                modifications.push(Modification::AddHeader {
                    name: annotation::ORIGINAL_TO_HEADER.to_string(),
                    value: recipient.clone(),
                });
            }
            log::info!(
                "Quarantining {} recipient(s) of {} to {}",
                self.quarantined.len(),
                self.sender,
                config.quarantine_box
            );
            modifications.push(Modification::AddRecipient(config.quarantine_box.clone()));
        }

        modifications
    }

    /// End of session.
    pub fn close(self) {
        log::debug!("Session from {} closed", self.client);
    }

    fn reset(&mut self) {
        self.quarantined.clear();
        self.subject = None;
        self.verdict = None;
        self.reason = None;
        self.null_sender = false;
        self.sender.clear();
    }

    fn apply_verdict(&mut self, verdict: SpfVerdict, reason: Option<String>) -> Disposition {
        let config = &self.engine.config;
        self.verdict = Some(verdict);
        self.reason = reason;

        // Exactly one of the two no-policy rules applies to a given message
        let refuse_none = if self.null_sender {
            config.refuse_none_helo
        } else {
            config.refuse_none
        };

        match verdict {
            SpfVerdict::None if refuse_none => {
                log::info!("Refusing {} without SPF policy from {}", self.sender, self.client);
                self.refuse("7.1", "Sender domain does not publish an SPF policy")
            }
            SpfVerdict::TempError if !config.accept_temperror => {
                Disposition::TempFail(Reply {
                    code: 451,
                    extended: "4.4.3".to_string(),
                    message: "Temporary error during SPF evaluation, try again later".to_string(),
                })
            }
            SpfVerdict::Fail if config.refuse_fail && !config.whitelist.has_recipient_rules() => {
                let reason = self.reject_reason();
                self.refuse("7.1", &reason)
            }
            _ => Disposition::Continue,
        }
    }

    fn malformed_sender(&self, raw: &str, error: AddressError) -> Disposition {
        log::info!("Malformed sender {raw:?} from {}: {error}", self.client);
        self.refuse("1.7", "Sender address does not conform to RFC-2821 syntax")
    }

    fn reject_reason(&self) -> String {
        annotation::format_reject_reason(
            &self.engine.config.reject_reason,
            &self.sender,
            &self.client.to_string(),
            &self.site,
        )
    }

    /// 550 5.x.y, or 451 4.x.y when soft rejection is configured.
    fn refuse(&self, detail: &str, message: &str) -> Disposition {
        if self.engine.config.soft_fail {
            Disposition::TempFail(Reply {
                code: 451,
                extended: format!("4.{detail}"),
                message: message.to_string(),
            })
        } else {
            Disposition::Reject(Reply {
                code: 550,
                extended: format!("5.{detail}"),
                message: message.to_string(),
            })
        }
    }
}
