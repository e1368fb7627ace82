use crate::config::ListenAddr;
use crate::transaction::{Disposition, Modification, PolicyEngine, SessionSignals, Transaction};
use anyhow::Context as _;
use indymilter::{
    Actions, Callbacks, Config as IndyConfig, Context, ContextActions, EomContext, Macros,
    SetErrorReply, SocketInfo, Status,
};
use std::ffi::{CStr, CString};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};

/// A bound, not yet served, milter socket.
///
/// Binding happens before privileges are dropped and the process forks; the
/// tokio listener is only created once the runtime is up.
pub enum Listener {
    Unix(std::os::unix::net::UnixListener, PathBuf),
    Tcp(std::net::TcpListener),
}

impl Listener {
    pub fn bind(addr: &ListenAddr) -> anyhow::Result<Self> {
        match addr {
            ListenAddr::Unix(path) => {
                // Remove a stale socket left behind by a previous run
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                }
                let listener = std::os::unix::net::UnixListener::bind(path)
                    .with_context(|| format!("Failed to bind {}", path.display()))?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Unix(listener, path.clone()))
            }
            ListenAddr::Inet(addr) => {
                let listener = std::net::TcpListener::bind(addr)
                    .with_context(|| format!("Failed to bind {addr}"))?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Tcp(listener))
            }
        }
    }
}

pub struct Milter {
    engine: Arc<PolicyEngine>,
}

impl Milter {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Milter { engine }
    }

    /// Serve MTA connections until `shutdown` resolves.
    pub async fn run(&self, listener: Listener, shutdown: impl Future) -> anyhow::Result<()> {
        let callbacks = self.callbacks();
        let config = IndyConfig {
            actions: Actions::ADD_HEADER
                | Actions::CHANGE_HEADER
                | Actions::ADD_RCPT
                | Actions::DELETE_RCPT,
            ..Default::default()
        };

        match listener {
            Listener::Unix(listener, path) => {
                log::info!("Starting milter on: unix:{}", path.display());
                let listener = UnixListener::from_std(listener)?;
                let result = indymilter::run(listener, callbacks, config, shutdown).await;
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("Failed to remove socket {}: {e}", path.display());
                }
                result?;
            }
            Listener::Tcp(listener) => {
                log::info!("Starting milter on: inet:{}", listener.local_addr()?);
                let listener = TcpListener::from_std(listener)?;
                indymilter::run(listener, callbacks, config, shutdown).await?;
            }
        }

        self.engine.shutdown();
        Ok(())
    }

    fn callbacks(&self) -> Callbacks<Transaction> {
        let engine = self.engine.clone();
        Callbacks::new()
            .on_connect(move |cx, hostname, socket_info| {
                Box::pin(handle_connect(engine.clone(), cx, hostname, socket_info))
            })
            .on_helo(|cx, helo| Box::pin(handle_helo(cx, helo)))
            .on_mail(|cx, args| Box::pin(handle_mail(cx, args)))
            .on_rcpt(|cx, args| Box::pin(handle_rcpt(cx, args)))
            .on_header(|cx, name, value| Box::pin(handle_header(cx, name, value)))
            .on_eom(|cx| Box::pin(handle_eom(cx)))
            .on_close(|cx| Box::pin(handle_close(cx)))
    }
}

async fn handle_connect(
    engine: Arc<PolicyEngine>,
    cx: &mut Context<Transaction>,
    hostname: CString,
    socket_info: SocketInfo,
) -> Status {
    let hostname = hostname.to_string_lossy();
    let client = match socket_info {
        SocketInfo::Inet(addr) => Some(addr.ip()),
        _ => None,
    };
    log::debug!("Connection from: {hostname} {client:?}");

    let site = macro_value(&cx.macros, c"j");
    match engine.connect(client, &hostname, site.as_deref()) {
        Some(tx) => {
            cx.data = Some(tx);
            Status::Continue
        }
        None => Status::Accept,
    }
}

async fn handle_helo(cx: &mut Context<Transaction>, helo: CString) -> Status {
    let Some(tx) = cx.data.as_mut() else {
        return Status::Continue;
    };
    let disposition = tx.helo(&helo.to_string_lossy());
    respond(cx, disposition)
}

async fn handle_mail(cx: &mut Context<Transaction>, args: Vec<CString>) -> Status {
    let signals = SessionSignals {
        authenticated_user: macro_value(&cx.macros, c"{auth_authen}"),
        verified: macro_value(&cx.macros, c"{verify}"),
    };
    let Some(tx) = cx.data.as_mut() else {
        return Status::Continue;
    };
    log::debug!("Mail from: {:?}", args);

    let disposition = tx.envelope_from(&to_strings(&args), &signals).await;
    respond(cx, disposition)
}

async fn handle_rcpt(cx: &mut Context<Transaction>, args: Vec<CString>) -> Status {
    let Some(tx) = cx.data.as_mut() else {
        return Status::Continue;
    };
    log::debug!("Rcpt to: {:?}", args);

    let disposition = tx.envelope_recipient(&to_strings(&args));
    respond(cx, disposition)
}

async fn handle_header(cx: &mut Context<Transaction>, name: CString, value: CString) -> Status {
    let Some(tx) = cx.data.as_mut() else {
        return Status::Continue;
    };
    let disposition = tx.header(&name.to_string_lossy(), &value.to_string_lossy());
    respond(cx, disposition)
}

async fn handle_eom(cx: &mut EomContext<Transaction>) -> Status {
    let Some(tx) = cx.data.as_mut() else {
        return Status::Continue;
    };

    for modification in tx.end_of_message() {
        let result = match &modification {
            Modification::ChangeHeader { name, index, value } => {
                let index = i32::try_from(*index).unwrap_or(1);
                cx.actions
                    .change_header(name.clone(), index, Some(value.clone()))
                    .await
            }
            Modification::AddHeader { name, value } => {
                cx.actions.add_header(name.clone(), value.clone()).await
            }
            Modification::DeleteRecipient(recipient) => {
                cx.actions.delete_recipient(recipient.clone()).await
            }
            Modification::AddRecipient(recipient) => {
                cx.actions.add_recipient(recipient.clone()).await
            }
        };
        if let Err(e) = result {
            log::error!("Failed to apply {modification:?}: {e}");
        }
    }

    Status::Continue
}

async fn handle_close(cx: &mut Context<Transaction>) -> Status {
    if let Some(tx) = cx.data.take() {
        tx.close();
    }
    Status::Continue
}

/// SMTP reply in the form the MTA expects it.
#[derive(Debug, PartialEq, Eq)]
struct ErrorReply {
    rcode: String,
    xcode: String,
    message: String,
}

fn status_for(disposition: Disposition) -> (Status, Option<ErrorReply>) {
    let (status, reply) = match disposition {
        Disposition::Continue => return (Status::Continue, None),
        Disposition::Accept => return (Status::Accept, None),
        Disposition::Reject(reply) => (Status::Reject, reply),
        Disposition::TempFail(reply) => (Status::Tempfail, reply),
    };
    let reply = ErrorReply {
        rcode: reply.code.to_string(),
        xcode: reply.extended,
        message: reply.message,
    };
    (status, Some(reply))
}

fn respond(cx: &mut Context<Transaction>, disposition: Disposition) -> Status {
    let (status, reply) = status_for(disposition);
    if let Some(reply) = reply {
        if let Err(e) = cx.reply.set_error_reply(
            &reply.rcode,
            Some(reply.xcode.as_str()),
            [reply.message.as_str()],
        ) {
            log::warn!("Failed to set reply {} {}: {e}", reply.rcode, reply.xcode);
        }
    }
    status
}

fn macro_value(macros: &Macros, name: &CStr) -> Option<String> {
    macros
        .get(name)
        .map(|value| value.to_string_lossy().into_owned())
        .filter(|value| !value.is_empty())
}

fn to_strings(args: &[CString]) -> Vec<String> {
    args.iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transaction::Reply;

    fn reply(code: u16, extended: &str) -> Reply {
        Reply {
            code,
            extended: extended.to_string(),
            message: "Sender address does not conform to RFC-2821 syntax".to_string(),
        }
    }

    #[test]
    fn test_reject_maps_to_5xx_reply() {
        let (status, reply) = status_for(Disposition::Reject(reply(550, "5.7.1")));
        assert!(matches!(status, Status::Reject));
        assert_eq!(
            reply,
            Some(ErrorReply {
                rcode: "550".to_string(),
                xcode: "5.7.1".to_string(),
                message: "Sender address does not conform to RFC-2821 syntax".to_string(),
            })
        );
    }

    #[test]
    fn test_tempfail_maps_to_4xx_reply() {
        let (status, reply) = status_for(Disposition::TempFail(reply(451, "4.4.3")));
        assert!(matches!(status, Status::Tempfail));
        let reply = reply.unwrap();
        assert_eq!(reply.rcode, "451");
        assert_eq!(reply.xcode, "4.4.3");
    }

    #[test]
    fn test_continue_and_accept_carry_no_reply() {
        let (status, reply) = status_for(Disposition::Continue);
        assert!(matches!(status, Status::Continue));
        assert!(reply.is_none());

        let (status, reply) = status_for(Disposition::Accept);
        assert!(matches!(status, Status::Accept));
        assert!(reply.is_none());
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spf-milter.sock");
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind(&ListenAddr::Unix(path.clone())).unwrap();
        match listener {
            Listener::Unix(_, bound) => assert_eq!(bound, path),
            Listener::Tcp(_) => panic!("expected a unix listener"),
        }
    }

    #[test]
    fn test_bind_inet() {
        let addr = "127.0.0.1:0".parse().unwrap();
        match Listener::bind(&ListenAddr::Inet(addr)).unwrap() {
            Listener::Tcp(listener) => {
                assert!(listener.local_addr().unwrap().ip().is_loopback())
            }
            Listener::Unix(..) => panic!("expected a tcp listener"),
        }
    }

    #[test]
    fn test_to_strings_is_lossy() {
        let args = vec![
            CString::new("<user@example.com>").unwrap(),
            CString::new(vec![b'S', b'I', b'Z', b'E', b'=', 0xff]).unwrap(),
        ];
        let strings = to_strings(&args);
        assert_eq!(strings[0], "<user@example.com>");
        assert!(strings[1].starts_with("SIZE="));
    }
}
