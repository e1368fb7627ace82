use crate::address;
use crate::verdict::SpfVerdict;
use async_trait::async_trait;
use std::net::IpAddr;

/// Everything the oracle needs to evaluate one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfRequest {
    pub client: IpAddr,
    pub helo: String,
    pub sender: String,
    /// Receiving host, used by the oracle for `%{r}` expansion.
    pub receiver: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfAnswer {
    pub verdict: SpfVerdict,
    pub reason: Option<String>,
}

impl SpfAnswer {
    pub fn new(verdict: SpfVerdict) -> Self {
        SpfAnswer {
            verdict,
            reason: None,
        }
    }
}

/// Sender authentication backend.
///
/// Implementations never fail: a lookup that cannot complete is reported as
/// [`SpfVerdict::TempError`].
#[async_trait]
pub trait SpfOracle: Send + Sync {
    async fn evaluate(&self, request: &SpfRequest) -> SpfAnswer;
}

/// SPF evaluation backed by the `mail-auth` resolver.
pub struct MailAuthOracle {
    resolver: mail_auth::Resolver,
}

impl MailAuthOracle {
    /// Build a resolver from the system DNS configuration.
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let resolver = mail_auth::Resolver::new_system_conf()?;
        Ok(MailAuthOracle { resolver })
    }
}

#[async_trait]
impl SpfOracle for MailAuthOracle {
    async fn evaluate(&self, request: &SpfRequest) -> SpfAnswer {
        let domain = address::domain_of(&request.sender).unwrap_or(&request.helo);
        let output = self
            .resolver
            .check_host(
                request.client,
                domain,
                &request.helo,
                &request.receiver,
                &request.sender,
            )
            .await;

        SpfAnswer {
            verdict: output.result().into(),
            reason: output.explanation().map(str::to_string),
        }
    }
}
