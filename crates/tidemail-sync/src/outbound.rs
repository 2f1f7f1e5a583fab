//! Outbound path: SMTP transmission plus a copy appended into the
//! account's sent folder.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Local;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, Message, MultiPart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use mailparse::{MailAddr, addrparse};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::{MailSession, SessionConnector};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub body: String,
    pub body_html: Option<String>,
}

/// Sends over SMTP and returns the formatted bytes for the sent copy.
pub async fn send_message(smtp: &SmtpConfig, outgoing: &OutgoingMessage) -> Result<Vec<u8>> {
    let email = build_message(&smtp.from, outgoing)?;
    let raw = email.formatted();
    let mailer = build_transport(smtp)?;
    mailer
        .send(email)
        .await
        .map_err(|e| anyhow!(e.to_string()))?;
    Ok(raw)
}

/// Sends and appends a `\Seen`-flagged copy into the first folder whose
/// name contains "sent".
pub async fn send_and_record<C>(
    smtp: &SmtpConfig,
    connector: Arc<C>,
    outgoing: &OutgoingMessage,
) -> Result<()>
where
    C: SessionConnector,
{
    let raw = send_message(smtp, outgoing).await?;
    tokio::task::spawn_blocking(move || save_sent(connector.as_ref(), &raw))
        .await
        .map_err(|err| anyhow!("sent-copy task failed: {err}"))?
}

fn save_sent<C: SessionConnector>(connector: &C, raw: &[u8]) -> Result<()> {
    let mut session = connector.connect()?;
    let result = append_to_sent(&mut session, raw);
    session.logout();
    result
}

fn append_to_sent<S: MailSession + ?Sized>(session: &mut S, raw: &[u8]) -> Result<()> {
    let folders = session.list_folders()?;
    let sent = folders
        .into_iter()
        .find(|name| name.to_lowercase().contains("sent"))
        .ok_or_else(|| anyhow!("no sent folder on server"))?;
    session.append(&sent, raw, true, Local::now().fixed_offset())?;
    debug!(folder = %sent, "stored sent copy");
    Ok(())
}

fn build_message(from: &str, outgoing: &OutgoingMessage) -> Result<Message> {
    let from_addr = parse_mailbox(from)?;
    let to_addrs = parse_mailbox_list(&outgoing.to)?;
    let cc_addrs = parse_mailbox_list(&outgoing.cc)?;
    let bcc_addrs = parse_mailbox_list(&outgoing.bcc)?;
    if to_addrs.is_empty() && cc_addrs.is_empty() && bcc_addrs.is_empty() {
        return Err(anyhow!("no recipients"));
    }

    let mut builder = Message::builder()
        .from(from_addr)
        .subject(outgoing.subject.clone());
    for addr in to_addrs {
        builder = builder.to(addr);
    }
    for addr in cc_addrs {
        builder = builder.cc(addr);
    }
    for addr in bcc_addrs {
        builder = builder.bcc(addr);
    }

    let email = if let Some(html) = &outgoing.body_html {
        builder.multipart(MultiPart::alternative_plain_html(
            outgoing.body.clone(),
            html.clone(),
        ))?
    } else {
        builder.body(outgoing.body.clone())?
    };
    Ok(email)
}

fn build_transport(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
    let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
    let mut tls_builder = TlsParameters::builder(smtp.host.clone());
    if smtp.skip_tls_verify {
        tls_builder = tls_builder
            .dangerous_accept_invalid_certs(true)
            .dangerous_accept_invalid_hostnames(true);
    }
    let tls_parameters = tls_builder.build()?;
    let builder = if smtp.port == 465 {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(Tls::Wrapper(tls_parameters))
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(Tls::Required(tls_parameters))
    };
    Ok(builder.credentials(creds).build())
}

fn parse_mailbox(input: &str) -> Result<Mailbox> {
    let trimmed = input.trim();
    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.find('>')) {
        let name = trimmed[..start].trim().trim_matches('"');
        let addr = trimmed[start + 1..end].trim();
        return Ok(Mailbox::new(Some(name.to_string()), addr.parse()?));
    }
    Ok(Mailbox::new(None, trimmed.parse()?))
}

fn parse_mailbox_list(input: &str) -> Result<Vec<Mailbox>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parsed = addrparse(trimmed)?;
    Ok(mailaddrs_to_mailboxes(&parsed))
}

fn mailaddrs_to_mailboxes(addrs: &[MailAddr]) -> Vec<Mailbox> {
    let mut out = Vec::new();
    for addr in addrs {
        match addr {
            MailAddr::Single(info) => {
                if let Ok(parsed) = info.addr.parse() {
                    out.push(Mailbox::new(info.display_name.clone(), parsed));
                }
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    if let Ok(parsed) = info.addr.parse() {
                        out.push(Mailbox::new(info.display_name.clone(), parsed));
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnector, MockState};

    #[test]
    fn mailbox_with_display_name_parses() {
        let mailbox = parse_mailbox("Alice Example <alice@example.com>").unwrap();
        assert_eq!(mailbox.name.as_deref(), Some("Alice Example"));
        assert_eq!(mailbox.email.to_string(), "alice@example.com");
    }

    #[test]
    fn mailbox_list_handles_empty_and_multiple() {
        assert!(parse_mailbox_list("  ").unwrap().is_empty());
        let list = parse_mailbox_list("a@example.com, Bob <b@example.com>").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name.as_deref(), Some("Bob"));
    }

    #[test]
    fn message_without_recipients_is_rejected() {
        let outgoing = OutgoingMessage {
            subject: "hi".to_string(),
            body: "hello".to_string(),
            ..OutgoingMessage::default()
        };
        let err = build_message("me@example.com", &outgoing).unwrap_err();
        assert!(err.to_string().contains("no recipients"));
    }

    #[test]
    fn sent_copy_lands_in_the_sent_folder() {
        let connector = MockConnector::new(MockState::with_folders(&[
            "INBOX",
            "Sent Items",
            "Trash",
        ]));
        save_sent(&connector, b"raw message").unwrap();
        let state = connector.state();
        assert_eq!(state.appends.len(), 1);
        assert_eq!(state.appends[0].0, "Sent Items");
        assert_eq!(state.appends[0].1, b"raw message");
        assert_eq!(state.logouts, 1);
    }

    #[test]
    fn missing_sent_folder_is_an_error() {
        let connector = MockConnector::new(MockState::with_folders(&["INBOX", "Trash"]));
        let err = save_sent(&connector, b"raw").unwrap_err();
        assert!(err.to_string().contains("no sent folder"));
        // the session is still torn down
        assert_eq!(connector.state().logouts, 1);
    }
}
