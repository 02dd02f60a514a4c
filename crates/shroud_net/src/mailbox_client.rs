//! Blocking TCP mailbox client.
//!
//! Short-lived connections only: a send connects to the recipient's
//! mailbox socket, writes one frame, and closes; a receive polls the own
//! mailbox socket with an empty frame. Transport hiccups are logged and
//! absorbed as message loss so the protocol's timeouts can recover.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::Context;
use shroud_core::{Mailbox, PeerId, ProtocolError, WireMsg, FP_ID};
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::wire::{self, ClientFrame};

/// How long to keep retrying the initial address table fetch.
const TABLE_FETCH_DEADLINE: Duration = Duration::from_secs(15);
const TABLE_FETCH_BACKOFF: Duration = Duration::from_millis(200);

pub struct TcpMailbox {
    id: String,
    addrs: HashMap<String, SocketAddr>,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl TcpMailbox {
    /// Fetch the address table from the rendezvous server (retrying while
    /// it comes up) and attach to the own mailbox.
    pub fn connect(
        id: &str,
        rendezvous: SocketAddr,
        transport: &TransportConfig,
    ) -> anyhow::Result<Self> {
        let deadline = Instant::now() + TABLE_FETCH_DEADLINE;
        let addrs = loop {
            match fetch_table(rendezvous) {
                Ok(table) => break table,
                Err(e) if Instant::now() < deadline => {
                    debug!(error = %e, "rendezvous not ready, retrying");
                    std::thread::sleep(TABLE_FETCH_BACKOFF);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("fetching address table from {rendezvous}")
                    })
                }
            }
        };
        anyhow::ensure!(
            addrs.contains_key(id),
            "participant `{id}` is not in the address table"
        );
        Ok(Self {
            id: id.to_string(),
            addrs,
            poll_interval: Duration::from_millis(transport.poll_interval_ms),
            connect_timeout: Duration::from_millis(transport.connect_timeout_ms),
        })
    }

    /// Input peer ids from the address table, sorted for a stable
    /// assembly order. Excludes the function party but not the caller.
    pub fn input_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .addrs
            .keys()
            .filter(|id| *id != FP_ID)
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    fn post(&self, addr: SocketAddr, frame: &ClientFrame) -> std::io::Result<()> {
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        wire::write_frame(&mut stream, frame)
    }

    fn poll_own_mailbox(&self) -> std::io::Result<Option<ClientFrame>> {
        let addr = self.addrs[&self.id];
        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        wire::write_poll(&mut stream)?;
        match wire::read_body(&mut stream)? {
            Some(body) => Ok(Some(wire::decode(&body)?)),
            None => Ok(None),
        }
    }
}

impl Mailbox for TcpMailbox {
    fn send(&mut self, to: &str, msg: WireMsg) -> Result<(), ProtocolError> {
        let Some(addr) = self.addrs.get(to).copied() else {
            warn!(recipient = %to, "unknown recipient, dropping message");
            return Ok(());
        };
        let frame = ClientFrame::Post {
            sender: self.id.clone(),
            payload: msg,
        };
        if let Err(e) = self.post(addr, &frame) {
            // Treated as loss: the protocol's retries compensate.
            warn!(recipient = %to, error = %e, "send failed, dropping message");
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<(PeerId, WireMsg)> {
        match self.poll_own_mailbox() {
            Ok(Some(ClientFrame::Post { sender, payload })) => Some((sender, payload)),
            Ok(Some(ClientFrame::Bye { sender })) => {
                debug!(participant = %sender, "stray goodbye in mailbox, ignoring");
                None
            }
            Ok(None) => {
                std::thread::sleep(self.poll_interval);
                None
            }
            Err(e) => {
                warn!(error = %e, "mailbox poll failed");
                std::thread::sleep(self.poll_interval);
                None
            }
        }
    }
}

impl Drop for TcpMailbox {
    fn drop(&mut self) {
        let frame = ClientFrame::Bye {
            sender: self.id.clone(),
        };
        let addr = self.addrs[&self.id];
        if let Err(e) = self.post(addr, &frame) {
            warn!(participant = %self.id, error = %e, "goodbye frame failed");
        }
    }
}

fn fetch_table(rendezvous: SocketAddr) -> anyhow::Result<HashMap<String, SocketAddr>> {
    let mut stream = TcpStream::connect_timeout(&rendezvous, Duration::from_secs(2))?;
    wire::write_poll(&mut stream)?;
    let body = wire::read_body(&mut stream)?.context("empty address table reply")?;
    Ok(serde_json::from_slice(&body)?)
}
