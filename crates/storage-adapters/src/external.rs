//! # Stand-ins for external services
//!
//! Local defaults for the best-effort collaborators. Deployments that talk to a real spam
//! service, SMTP relay or translation API plug in their own adapters behind the same ports.

use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use domains::{
    DetectedLanguage, GeoInfo, GeoLocator, LanguageDetector, Mailer, OutgoingMail, ServiceFailure,
    SpamCheckRequest, SpamChecker, Translator,
};
use tracing::{debug, info};

/// Treats everything as ham.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpamChecker;

#[async_trait]
impl SpamChecker for NoopSpamChecker {
    async fn is_spam(&self, request: &SpamCheckRequest) -> Result<bool, ServiceFailure> {
        debug!(author = %request.author, "spam check disabled");
        Ok(false)
    }
}

/// Writes mail to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), ServiceFailure> {
        info!(from = %mail.from, to = %mail.to, subject = %mail.subject, "mail");
        Ok(())
    }
}

/// Keeps every mail in memory.
#[derive(Debug, Default)]
pub struct OutboxMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

impl OutboxMailer {
    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for OutboxMailer {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), ServiceFailure> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(mail.clone());
        Ok(())
    }
}

/// Never detects anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLanguageDetector;

#[async_trait]
impl LanguageDetector for NoopLanguageDetector {
    async fn detect(&self, _text: &str) -> Result<Option<DetectedLanguage>, ServiceFailure> {
        Ok(None)
    }
}

/// Translation is not configured; every request fails and callers fall back to the original.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, _text: &str, target_lang: &str) -> Result<String, ServiceFailure> {
        Err(format!("no translator configured for {target_lang}").into())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeoLocator;

#[async_trait]
impl GeoLocator for NoopGeoLocator {
    async fn locate(&self, _ip: &str) -> Result<Option<GeoInfo>, ServiceFailure> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbox_keeps_mail_in_order() {
        let outbox = OutboxMailer::default();
        for to in ["a@example.org", "b@example.org"] {
            outbox
                .send(&OutgoingMail {
                    from: "agora@example.org".into(),
                    to: to.into(),
                    subject: "hi".into(),
                    body: String::new(),
                })
                .await
                .unwrap();
        }
        let sent = outbox.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].to, "b@example.org");
    }

    #[test]
    fn translator_stand_in_always_fails() {
        let result = tokio_test::block_on(NoopTranslator.translate("hola", "en"));
        assert!(result.is_err());
    }
}
