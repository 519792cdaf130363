use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use tracing::info;

use crate::config::SmtpConfig;

const RESET_SUBJECT: &str = "Change password";

/// Outbound email. Callers decide whether a failure matters.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, html: &str) -> anyhow::Result<()>;
}

/// Development mailer: writes the message to the log instead of delivering it.
#[derive(Clone, Debug)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, html: &str) -> anyhow::Result<()> {
        info!(to = %to, html = %html, "email send stub");
        Ok(())
    }
}

#[derive(Clone)]
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(cfg: &SmtpConfig) -> anyhow::Result<Self> {
        let mut builder = SmtpTransport::relay(&cfg.host).context("smtp relay")?;
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let from = cfg
            .from
            .parse::<Mailbox>()
            .with_context(|| format!("invalid MAIL_FROM {:?}", cfg.from))?;
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, html: &str) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse::<Mailbox>().context("invalid recipient")?)
            .subject(RESET_SUBJECT)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())
            .context("build email")?;

        // SmtpTransport blocks on network IO.
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .context("smtp task")?
            .context("smtp send")?;
        info!(to = %to, "email sent");
        Ok(())
    }
}
