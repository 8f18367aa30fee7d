//! Outbound send correlator.
//!
//! A send is a short exchange on the shared serial channel:
//!
//! 1. `AT+CMGS="<number>"\r`, then a settle delay
//! 2. the body and `\r`, then a settle delay
//! 3. Ctrl+Z
//!
//! after which the modem answers `+CMGS: <ref>` or `+CMS ERROR: <code>`. The
//! answer arrives on the same chunk stream the inbound parser listens to, so
//! each attempt takes its own [`Subscription`] and feeds it into a
//! [`PendingCorrelation`] until a marker shows up or the timeout expires.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep, timeout_at};

use super::commands::{CTRL_Z, MARKER_SEND_ERROR, MARKER_SENT, send_prompt};
use super::{BatchResult, OutboundSendRequest, OutboundSendResult, SendStatus};
use crate::config::ModemConfig;
use crate::error::{ModemError, Result};
use crate::serial::encoding::decode_text;
use crate::serial::{SerialLink, Subscription};

static CMS_ERROR_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CMS ERROR: (\d+)").expect("Invalid regex pattern"));

/// Puts `raw` in international form. Numbers starting with `+` are kept,
/// others lose one leading zero and gain `country_code`.
///
/// # Examples
///
/// ```
/// use modem_sms::sms::sender::normalize_phone;
///
/// assert_eq!(normalize_phone("0760449295", "+255"), "+255760449295");
/// assert_eq!(normalize_phone("+14155550100", "+255"), "+14155550100");
/// ```
#[must_use]
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('+') {
        raw.to_string()
    } else {
        let local = raw.strip_prefix('0').unwrap_or(raw);
        format!("{country_code}{local}")
    }
}

/// Address to answer an inbound sender at.
///
/// Unlike [`normalize_phone`], digits that already start with the country
/// code only gain the `+`; the local-number rule applies to a leading zero.
///
/// # Examples
///
/// ```
/// use modem_sms::sms::sender::reply_address;
///
/// assert_eq!(reply_address("255712345678", "+255"), "+255712345678");
/// assert_eq!(reply_address("0712345678", "+255"), "+255712345678");
/// ```
#[must_use]
pub fn reply_address(sender: &str, country_code: &str) -> String {
    let sender = sender.trim();
    let digits = country_code.trim_start_matches('+');
    if !digits.is_empty() && sender.starts_with(digits) {
        format!("+{sender}")
    } else {
        normalize_phone(sender, country_code)
    }
}

/// Appends the send timestamp to the body, as every outgoing text carries it.
#[must_use]
pub fn compose_message(message: &str, now: DateTime<Local>) -> String {
    let stamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
    if message.is_empty() {
        format!("Message sent at {stamp}")
    } else {
        format!("{message}\rsent at {stamp}")
    }
}

/// How an attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub status: SendStatus,
    pub error_code: Option<String>,
    pub response: String,
}

/// Response bytes collected for one attempt, resolved at most once.
///
/// The first resolution sticks; later markers, timeouts or failures are
/// ignored.
#[derive(Debug, Default)]
pub struct PendingCorrelation {
    accumulated: Vec<u8>,
    resolved: Option<Resolution>,
}

impl PendingCorrelation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk and checks for a success or error marker.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<&Resolution> {
        if self.resolved.is_none() {
            self.accumulated.extend_from_slice(chunk);
            let text = decode_text(&self.accumulated);
            if text.contains(MARKER_SENT) {
                self.resolve(SendStatus::Sent, None, text.trim().to_string());
            } else if text.contains(MARKER_SEND_ERROR) {
                let code = CMS_ERROR_CODE
                    .captures(&text)
                    .map_or_else(|| "unknown".to_string(), |c| c[1].to_string());
                self.resolve(SendStatus::Failed, Some(code), text.trim().to_string());
            }
        }
        self.resolved.as_ref()
    }

    /// No verdict arrived in time; resolves as unknown with what was heard.
    pub fn expire(&mut self) -> &Resolution {
        let response = self.text();
        self.resolve(SendStatus::Unknown, None, response)
    }

    /// The exchange could not be carried out.
    pub fn fail(&mut self, reason: impl Into<String>) -> &Resolution {
        self.resolve(SendStatus::Failed, None, reason.into())
    }

    fn resolve(&mut self, status: SendStatus, error_code: Option<String>, response: String) -> &Resolution {
        self.resolved.get_or_insert(Resolution {
            status,
            error_code,
            response,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Everything received so far, trimmed.
    pub fn text(&self) -> String {
        decode_text(&self.accumulated).trim().to_string()
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolved.as_ref()
    }
}

struct SenderInner {
    link: Arc<SerialLink>,
    // One exchange on the channel at a time.
    lock: Mutex<()>,
    country_code: String,
    settle: Duration,
    timeout: Duration,
}

/// Sends SMS over a [`SerialLink`], one attempt at a time.
///
/// Cheap to clone; clones share the channel and the send lock, so attempts
/// from any clone never overlap.
#[derive(Clone)]
pub struct SmsSender {
    inner: Arc<SenderInner>,
}

impl SmsSender {
    pub fn new(link: Arc<SerialLink>, config: &ModemConfig) -> Self {
        Self::with_timing(
            link,
            &config.country_code,
            config.settle_delay(),
            config.send_timeout(),
        )
    }

    pub fn with_timing(
        link: Arc<SerialLink>,
        country_code: &str,
        settle: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                link,
                lock: Mutex::new(()),
                country_code: country_code.to_string(),
                settle,
                timeout,
            }),
        }
    }

    pub fn link(&self) -> &Arc<SerialLink> {
        &self.inner.link
    }

    pub fn country_code(&self) -> &str {
        &self.inner.country_code
    }

    /// Sends `message` to every number in order, one after another.
    ///
    /// Per-recipient outcomes, including modem errors and timeouts, are in the
    /// returned batch. Only an empty recipient list is an error; a blank
    /// entry in it is reported as failed without touching the modem.
    pub async fn send_batch<S: AsRef<str>>(&self, phones: &[S], message: &str) -> Result<BatchResult> {
        if phones.is_empty() {
            return Err(ModemError::invalid_request("No phone numbers provided."));
        }
        let body = compose_message(message, Local::now());

        let mut results = Vec::with_capacity(phones.len());
        for raw in phones {
            if raw.as_ref().trim().is_empty() {
                warn!("Skipping blank phone number");
                results.push(OutboundSendResult {
                    recipient_phone: String::new(),
                    status: SendStatus::Failed,
                    error_code: None,
                    raw_response: "Empty phone number.".to_string(),
                    sent_at: Local::now(),
                });
                continue;
            }
            let request = OutboundSendRequest {
                recipient_phone: normalize_phone(raw.as_ref(), &self.inner.country_code),
                message_body: body.clone(),
                sent_at: Local::now(),
            };
            let result = self.send(&request).await;
            info!("SMS to {}: {}", result.recipient_phone, result.status);
            results.push(result);
        }
        Ok(BatchResult::new(results))
    }

    /// Runs one send exchange and waits for its verdict.
    pub async fn send(&self, request: &OutboundSendRequest) -> OutboundSendResult {
        let _turn = self.inner.lock.lock().await;
        let mut subscription = self.inner.link.subscribe();
        let mut pending = PendingCorrelation::new();

        match self.write_exchange(request).await {
            Ok(()) => self.await_verdict(&mut subscription, &mut pending).await,
            Err(e) => {
                warn!("Send to {} aborted: {e}", request.recipient_phone);
                pending.fail(e.to_string());
            }
        }
        drop(subscription);

        let resolution = pending.resolution().cloned().unwrap_or_else(|| Resolution {
            status: SendStatus::Unknown,
            error_code: None,
            response: pending.text(),
        });
        OutboundSendResult {
            recipient_phone: request.recipient_phone.clone(),
            status: resolution.status,
            error_code: resolution.error_code,
            raw_response: resolution.response,
            sent_at: Local::now(),
        }
    }

    async fn write_exchange(&self, request: &OutboundSendRequest) -> Result<()> {
        let link = &self.inner.link;
        debug!("-> AT+CMGS to {}", request.recipient_phone);
        link.write(send_prompt(&request.recipient_phone))?;
        sleep(self.inner.settle).await;
        link.write(format!("{}\r", request.message_body))?;
        sleep(self.inner.settle).await;
        link.write(vec![CTRL_Z])?;
        Ok(())
    }

    async fn await_verdict(&self, subscription: &mut Subscription, pending: &mut PendingCorrelation) {
        let deadline = Instant::now() + self.inner.timeout;
        while !pending.is_resolved() {
            match timeout_at(deadline, subscription.recv()).await {
                Ok(Some(chunk)) => {
                    pending.feed(&chunk);
                }
                Ok(None) => {
                    warn!("Serial link closed while waiting for send verdict");
                    pending.expire();
                }
                Err(_) => {
                    debug!("No send verdict within {:?}", self.inner.timeout);
                    pending.expire();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sms::fake_modem::FakeModem;
    use chrono::TimeZone;

    const SETTLE: Duration = Duration::from_millis(200);
    const TIMEOUT: Duration = Duration::from_millis(3000);

    fn sender_for(link: Arc<SerialLink>) -> SmsSender {
        SmsSender::with_timing(link, "+255", SETTLE, TIMEOUT)
    }

    fn frame(phone: &str, body: &str) -> Vec<u8> {
        let mut frame = send_prompt(phone).into_bytes();
        frame.extend_from_slice(body.as_bytes());
        frame.push(b'\r');
        frame.push(CTRL_Z);
        frame
    }

    #[test]
    fn test_normalize_strips_one_leading_zero() {
        assert_eq!(normalize_phone("0760449295", "+255"), "+255760449295");
        assert_eq!(normalize_phone("00760", "+255"), "+2550760");
        assert_eq!(normalize_phone("760449295", "+255"), "+255760449295");
    }

    #[test]
    fn test_normalize_keeps_plus_numbers() {
        assert_eq!(normalize_phone("+255760449295", "+1"), "+255760449295");
        assert_eq!(normalize_phone(" +447700900123 ", "+255"), "+447700900123");
    }

    #[test]
    fn test_reply_address_keeps_country_code_digits() {
        assert_eq!(reply_address("255712345678", "+255"), "+255712345678");
        assert_eq!(reply_address("+447700900123", "+255"), "+447700900123");
        assert_eq!(reply_address("0712345678", "+255"), "+255712345678");
        assert_eq!(reply_address("712345678", "+255"), "+255712345678");
    }

    #[test]
    fn test_compose_message_appends_timestamp() {
        let now = Local.with_ymd_and_hms(2025, 1, 2, 14, 30, 0).unwrap();
        let stamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, false);
        assert_eq!(compose_message("Hi", now), format!("Hi\rsent at {stamp}"));
        assert_eq!(compose_message("", now), format!("Message sent at {stamp}"));
        assert_eq!(compose_message("  ", now), format!("  \rsent at {stamp}"));
    }

    #[test]
    fn test_correlation_sent_marker() {
        let mut pending = PendingCorrelation::new();
        assert!(pending.feed(b"\r\n+CM").is_none());
        let resolution = pending.feed(b"GS: 12\r\n\r\nOK\r\n").unwrap();
        assert_eq!(resolution.status, SendStatus::Sent);
        assert_eq!(resolution.response, "+CMGS: 12\r\n\r\nOK");
    }

    #[test]
    fn test_correlation_error_marker_extracts_code() {
        let mut pending = PendingCorrelation::new();
        let resolution = pending.feed(b"\r\n+CMS ERROR: 500\r\n").unwrap();
        assert_eq!(resolution.status, SendStatus::Failed);
        assert_eq!(resolution.error_code.as_deref(), Some("500"));
    }

    #[test]
    fn test_correlation_error_without_code() {
        let mut pending = PendingCorrelation::new();
        let resolution = pending.feed(b"+CMS ERROR: network\r\n").unwrap();
        assert_eq!(resolution.error_code.as_deref(), Some("unknown"));
    }

    #[test]
    fn test_correlation_first_resolution_wins() {
        let mut pending = PendingCorrelation::new();
        pending.feed(b"+CMGS: 7\r\n");
        pending.feed(b"+CMS ERROR: 500\r\n");
        pending.expire();
        pending.fail("late");
        let resolution = pending.resolution().unwrap();
        assert_eq!(resolution.status, SendStatus::Sent);
        assert_eq!(resolution.error_code, None);
    }

    #[test]
    fn test_correlation_expire_keeps_partial_text() {
        let mut pending = PendingCorrelation::new();
        pending.feed(b"> ");
        let resolution = pending.expire();
        assert_eq!(resolution.status, SendStatus::Unknown);
        assert_eq!(resolution.response, ">");
    }

    #[test]
    fn test_unsolicited_header_is_not_a_verdict() {
        let mut pending = PendingCorrelation::new();
        assert!(
            pending
                .feed(b"+CMT: \"255712345678\",,\"25/01/02,14:30:00+02\"\r\nHello\r\n")
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_sends_sequentially_in_order() {
        let (link, modem) = FakeModem::start(|_| Some("\r\n+CMGS: 1\r\n\r\nOK\r\n".into()));
        let sender = sender_for(link.clone());

        let batch = sender
            .send_batch(&["0711111111", "+255722222222", "733333333"], "Hello")
            .await
            .unwrap();

        let phones: Vec<_> = batch.messages.iter().map(|m| m.recipient_phone.as_str()).collect();
        assert_eq!(phones, ["+255711111111", "+255722222222", "+255733333333"]);
        assert!(batch.messages.iter().all(|m| m.status == SendStatus::Sent));
        assert_eq!(batch.sent_count(), 3);

        let body = &batch.messages[0].raw_response;
        assert!(body.contains("+CMGS: 1"));

        let stamped = modem.received_text();
        let body_start = stamped.find("Hello").unwrap();
        let body_end = stamped.find('\u{1a}').unwrap() - 1;
        let sent_body = &stamped[body_start..body_end];
        let mut expected = Vec::new();
        for phone in phones {
            expected.extend(frame(phone, sent_body));
        }
        assert_eq!(modem.received(), expected);
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modem_error_resolves_failed() {
        let (link, _modem) = FakeModem::start(|_| Some("\r\n+CMS ERROR: 500\r\n".into()));
        let sender = sender_for(link.clone());

        let batch = sender.send_batch(&["0760449295"], "Hi").await.unwrap();
        let result = &batch.messages[0];
        assert_eq!(result.status, SendStatus::Failed);
        assert_eq!(result.error_code.as_deref(), Some("500"));
        assert_eq!(result.raw_response, "+CMS ERROR: 500");
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_modem_resolves_unknown_after_timeout() {
        let (link, _modem) = FakeModem::start(|_| None);
        let sender = sender_for(link.clone());

        let start = Instant::now();
        let batch = sender.send_batch(&["0760449295"], "Hi").await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(batch.messages[0].status, SendStatus::Unknown);
        assert_eq!(batch.messages[0].error_code, None);
        assert!(elapsed >= SETTLE * 2 + TIMEOUT);
        assert!(elapsed < SETTLE * 2 + TIMEOUT + Duration::from_millis(50));
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_keeps_partial_response() {
        let (link, _modem) = FakeModem::start(|_| Some("\r\n> ".into()));
        let sender = sender_for(link);

        let batch = sender.send_batch(&["+255760449295"], "Hi").await.unwrap();
        assert_eq!(batch.messages[0].status, SendStatus::Unknown);
        assert_eq!(batch.messages[0].raw_response, ">");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcomes_keep_input_order() {
        let (link, _modem) = FakeModem::start(|phone| match phone {
            "+255700000001" => Some("\r\n+CMGS: 3\r\n".into()),
            "+255700000002" => Some("\r\n+CMS ERROR: 38\r\n".into()),
            _ => None,
        });
        let sender = sender_for(link);

        let batch = sender
            .send_batch(&["0700000001", "0700000002", "0700000003"], "Hi")
            .await
            .unwrap();
        let statuses: Vec<_> = batch.messages.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            [SendStatus::Sent, SendStatus::Failed, SendStatus::Unknown]
        );
        assert_eq!(batch.messages[1].error_code.as_deref(), Some("38"));
    }

    #[tokio::test]
    async fn test_empty_recipient_list_rejected() {
        let (link, modem) = FakeModem::start(|_| None);
        let sender = sender_for(link);
        let phones: [&str; 0] = [];

        let err = sender.send_batch(&phones, "Hi").await.unwrap_err();
        assert!(matches!(err, ModemError::InvalidRequest(_)));
        assert!(modem.received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_number_fails_without_sending() {
        let (link, modem) = FakeModem::start(|_| Some("\r\n+CMGS: 2\r\n".into()));
        let sender = sender_for(link);

        let batch = sender.send_batch(&["  ", "0711111111"], "Hi").await.unwrap();
        assert_eq!(batch.messages[0].status, SendStatus::Failed);
        assert_eq!(batch.messages[0].recipient_phone, "");
        assert_eq!(batch.messages[1].status, SendStatus::Sent);
        let text = modem.received_text();
        assert_eq!(text.matches("AT+CMGS=").count(), 1);
        assert!(text.starts_with("AT+CMGS=\"+255711111111\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_after_submit_resolves_unknown() {
        let (link, modem) = FakeModem::start(|_| None);
        let sender = sender_for(link.clone());

        let start = Instant::now();
        let send = tokio::spawn(async move { sender.send_batch(&["0760449295"], "Hi").await });
        while !modem.received().contains(&CTRL_Z) {
            sleep(Duration::from_millis(10)).await;
        }
        modem.hang_up().await;

        let batch = send.await.unwrap().unwrap();
        assert_eq!(batch.messages[0].status, SendStatus::Unknown);
        assert_eq!(batch.messages[0].error_code, None);
        assert!(start.elapsed() < SETTLE * 2 + TIMEOUT);
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_link_resolves_failed() {
        let (link, modem) = FakeModem::start(|_| None);
        modem.hang_up().await;
        link.closed().await;
        let sender = sender_for(link.clone());

        let batch = sender.send_batch(&["0760449295"], "Hi").await.unwrap();
        assert_eq!(batch.messages[0].status, SendStatus::Failed);
        assert!(batch.messages[0].raw_response.contains("/dev/ttyFAKE"));
        assert_eq!(link.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_do_not_interleave() {
        let (link, modem) = FakeModem::start(|_| Some("\r\n+CMGS: 9\r\n".into()));
        let sender = sender_for(link);

        let first = sender.clone();
        let second = sender.clone();
        let (a, b) = tokio::join!(
            first.send_batch(&["+255700000001"], "one"),
            second.send_batch(&["+255700000002"], "two"),
        );
        assert_eq!(a.unwrap().messages[0].status, SendStatus::Sent);
        assert_eq!(b.unwrap().messages[0].status, SendStatus::Sent);

        let text = modem.received_text();
        let frames: Vec<&str> = text.split_inclusive('\u{1a}').collect();
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert_eq!(frame.matches("AT+CMGS=").count(), 1);
        }
    }
}
