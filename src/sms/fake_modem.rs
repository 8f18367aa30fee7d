//! In-memory modem for tests: records what it is sent and answers each
//! Ctrl+Z terminated send with a canned reply.

use std::sync::{Arc, Mutex};

use tokio::io::{self, AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::task::JoinHandle;

use super::commands::CTRL_Z;
use crate::serial::{PortSettings, SerialLink};

pub(crate) struct FakeModem {
    received: Arc<Mutex<Vec<u8>>>,
    writer: Arc<tokio::sync::Mutex<Option<WriteHalf<DuplexStream>>>>,
    task: JoinHandle<()>,
}

impl FakeModem {
    /// `responder` gets the number from the `AT+CMGS` prompt and returns the
    /// reply, or `None` to stay silent.
    pub(crate) fn start<F>(responder: F) -> (Arc<SerialLink>, FakeModem)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let (ours, theirs) = io::duplex(4096);
        let link = Arc::new(SerialLink::spawn(
            ours,
            PortSettings::new("/dev/ttyFAKE"),
            64,
        ));
        let (mut rd, wr) = io::split(theirs);
        let writer = Arc::new(tokio::sync::Mutex::new(Some(wr)));
        let received = Arc::new(Mutex::new(Vec::new()));

        let task_writer = writer.clone();
        let task_received = received.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let mut frame = Vec::new();
            loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                task_received.lock().unwrap().extend_from_slice(&buf[..n]);
                frame.extend_from_slice(&buf[..n]);
                while let Some(end) = frame.iter().position(|b| *b == CTRL_Z) {
                    let sent: Vec<u8> = frame.drain(..=end).collect();
                    let text = String::from_utf8_lossy(&sent);
                    let phone = text.split('"').nth(1).unwrap_or_default();
                    if let Some(reply) = responder(phone) {
                        if let Some(w) = task_writer.lock().await.as_mut() {
                            let _ = w.write_all(reply.as_bytes()).await;
                        }
                    }
                }
            }
        });

        (
            link,
            FakeModem {
                received,
                writer,
                task,
            },
        )
    }

    /// Pushes unsolicited output to the driver.
    pub(crate) async fn inject(&self, data: &[u8]) {
        let mut writer = self.writer.lock().await;
        writer
            .as_mut()
            .expect("modem hung up")
            .write_all(data)
            .await
            .unwrap();
    }

    /// Disconnects, as if the device was unplugged.
    pub(crate) async fn hang_up(&self) {
        self.task.abort();
        self.writer.lock().await.take();
    }

    pub(crate) fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn received_text(&self) -> String {
        String::from_utf8_lossy(&self.received()).into_owned()
    }
}
