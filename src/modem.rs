//! # Modem Module
//!
//! The public face of the driver. [`ModemService`] owns the single serial
//! session and exposes the two operations callers need:
//!
//! - [`ModemService::start_listening`]: find and open the modem, switch it to
//!   text mode with immediate `+CMT:` delivery, then parse inbound messages in
//!   a background task until the channel dies.
//! - [`ModemService::send_batch`]: send one text to a list of numbers.
//!
//! Every parsed message is handed to the [`MessageStore`] and, when an
//! acknowledgment is configured, answered by an auto-reply task that runs
//! independently of the parser.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ModemConfig;
use crate::error::{ModemError, Result};
use crate::port::{PortLister, SystemPorts, find_modem_port};
use crate::serial::{PortSettings, SerialLink, SerialSession, Subscription};
use crate::sms::commands::{CMD_PING, CMD_TEXT_MODE, run_sequence};
use crate::sms::parser::FrameParser;
use crate::sms::sender::{SmsSender, reply_address};
use crate::sms::{BatchResult, InboundSms, MessageStore, SendStatus};

struct Session {
    sender: SmsSender,
    listening: bool,
}

/// Driver for one modem.
pub struct ModemService {
    config: ModemConfig,
    lister: Arc<dyn PortLister>,
    store: Arc<dyn MessageStore>,
    session: Mutex<Option<Session>>,
}

impl ModemService {
    pub fn new(
        config: ModemConfig,
        lister: Arc<dyn PortLister>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            config,
            lister,
            store,
            session: Mutex::new(None),
        }
    }

    /// Uses an already open link instead of discovering the device.
    pub fn with_link(
        config: ModemConfig,
        link: Arc<SerialLink>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        let sender = SmsSender::new(link, &config);
        Self {
            config,
            lister: Arc::new(SystemPorts),
            store,
            session: Mutex::new(Some(Session {
                sender,
                listening: false,
            })),
        }
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    /// Current session, if one is open.
    pub async fn session(&self) -> Option<SerialSession> {
        let session = self.session.lock().await;
        session
            .as_ref()
            .map(|s| s.sender.link().session())
            .filter(|s| s.is_open)
    }

    /// Opens the modem and starts turning its output into [`InboundSms`].
    ///
    /// Fails with [`ModemError::PortNotFound`] or [`ModemError::PortOpen`]
    /// when the device is unavailable. Once started, parse and auto-reply
    /// problems are only logged; the returned handle completes when the
    /// serial channel fails.
    pub async fn start_listening(&self) -> Result<ListenHandle> {
        let mut session = self.session.lock().await;
        let (sender, _) = self.ensure_session(&mut session).await?;
        if session.as_ref().is_some_and(|s| s.listening) {
            return Err(ModemError::invalid_request("already listening"));
        }

        let link = sender.link().clone();
        // Subscribe before initializing so nothing sent afterwards is missed.
        let subscription = link.subscribe();
        run_sequence(&link, &self.config.init_commands, self.config.settle_delay()).await?;

        let listener = Listener {
            sender: sender.clone(),
            store: self.store.clone(),
            auto_reply: self.config.auto_reply.clone(),
        };
        let task = tokio::spawn(listener.run(subscription));
        if let Some(session) = session.as_mut() {
            session.listening = true;
        }
        info!("Listening on {}...", link.settings().port_name);
        Ok(ListenHandle { task, link })
    }

    /// Sends `message` to each number, strictly one after another.
    ///
    /// Opens the modem first if listening has not started. The batch is
    /// handed to the store before it is returned.
    pub async fn send_batch<S: AsRef<str>>(&self, phones: &[S], message: &str) -> Result<BatchResult> {
        if phones.is_empty() {
            return Err(ModemError::invalid_request("No phone numbers provided."));
        }
        let sender = {
            let mut session = self.session.lock().await;
            let (sender, fresh) = self.ensure_session(&mut session).await?;
            if fresh {
                run_sequence(
                    sender.link(),
                    &[CMD_PING, CMD_TEXT_MODE],
                    self.config.settle_delay(),
                )
                .await?;
            }
            sender
        };

        let batch = sender.send_batch(phones, message).await?;
        if let Err(e) = self.store.store_outbound(&batch) {
            warn!("Failed to store sent batch: {e}");
        }
        Ok(batch)
    }

    /// Returns the open session's sender, opening the device if there is
    /// none. The flag is true when the device was opened by this call.
    async fn ensure_session(&self, session: &mut Option<Session>) -> Result<(SmsSender, bool)> {
        if let Some(current) = session.as_ref() {
            if current.sender.link().is_open() {
                return Ok((current.sender.clone(), false));
            }
            warn!(
                "Serial session on {} is {}, reopening",
                current.sender.link().settings().port_name,
                current.sender.link().state()
            );
        }

        let port = find_modem_port(self.lister.as_ref(), &self.config.fingerprint())?;
        let settings = PortSettings::new(port.path).with_baud_rate(self.config.baud_rate);
        let link = SerialLink::open(settings, self.config.channel_capacity).await?;
        let sender = SmsSender::new(Arc::new(link), &self.config);
        *session = Some(Session {
            sender: sender.clone(),
            listening: false,
        });
        Ok((sender, true))
    }
}

/// Handle to a running listen task.
pub struct ListenHandle {
    task: JoinHandle<()>,
    link: Arc<SerialLink>,
}

impl std::fmt::Debug for ListenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenHandle").finish_non_exhaustive()
    }
}

impl ListenHandle {
    pub fn session(&self) -> SerialSession {
        self.link.session()
    }

    /// Waits until listening ends.
    pub async fn join(self) {
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            error!("Listen task failed: {e}");
        }
    }

    pub fn link(&self) -> &Arc<SerialLink> {
        &self.link
    }
}

struct Listener {
    sender: SmsSender,
    store: Arc<dyn MessageStore>,
    auto_reply: Option<String>,
}

impl Listener {
    async fn run(self, mut subscription: Subscription) {
        let mut parser = FrameParser::new();
        while let Some(chunk) = subscription.recv().await {
            for sms in parser.push(&chunk) {
                self.deliver(&sms);
            }
        }
        for sms in parser.finish() {
            self.deliver(&sms);
        }
        error!(
            "Serial link {} is {}, stopped listening",
            self.sender.link().settings().port_name,
            self.sender.link().state()
        );
    }

    fn deliver(&self, sms: &InboundSms) {
        if let Err(e) = self.store.store_inbound(sms) {
            warn!("Failed to store SMS from {}: {e}", sms.sender);
        }
        let Some(reply) = &self.auto_reply else {
            return;
        };
        if sms.sender.is_empty() {
            warn!("SMS without sender number, not auto-replying");
            return;
        }
        let to = reply_address(&sms.sender, self.sender.country_code());
        spawn_auto_reply(self.sender.clone(), to, reply.clone());
    }
}

/// Sends the acknowledgment in its own task. The outcome is only logged.
fn spawn_auto_reply(sender: SmsSender, to: String, message: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match sender.send_batch(&[to.as_str()], &message).await {
            Ok(batch) => {
                for result in &batch.messages {
                    match result.status {
                        SendStatus::Sent => info!("Auto-replied to {}", result.recipient_phone),
                        status => warn!(
                            "Auto-reply to {} {status}: {}",
                            result.recipient_phone, result.raw_response
                        ),
                    }
                }
            }
            Err(e) => warn!("Failed to send auto-reply to {to}: {e}"),
        }
    })
}
