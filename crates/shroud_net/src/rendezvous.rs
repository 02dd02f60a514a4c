//! Rendezvous and mailbox server.
//!
//! One listening socket per participant acts as that participant's
//! mailbox: peers deposit frames by connecting to the recipient's socket,
//! and a participant polls its own socket with an empty frame to collect
//! the next one. The public socket only hands out the address table. The
//! server stays up until every participant (input peers and the function
//! party) has sent a `Bye` frame.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use shroud_core::FP_ID;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::wire::{self, ClientFrame};

struct Shared {
    /// Encoded frames waiting for pickup, per participant.
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    /// Participants that have not said goodbye yet.
    remaining: Mutex<HashSet<String>>,
    done: Notify,
}

pub struct Rendezvous {
    public: TcpListener,
    mailboxes: Vec<(String, TcpListener)>,
    table: Arc<Vec<u8>>,
    shared: Arc<Shared>,
}

impl Rendezvous {
    /// Bind the public socket plus one mailbox socket per participant
    /// (the function party is added implicitly).
    pub async fn bind(addr: SocketAddr, peer_ids: &[String]) -> anyhow::Result<Self> {
        let mut participants: Vec<String> = peer_ids.to_vec();
        participants.push(FP_ID.to_string());
        let unique: HashSet<&String> = participants.iter().collect();
        anyhow::ensure!(
            unique.len() == participants.len(),
            "participant ids must be unique"
        );

        let public = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding rendezvous socket on {addr}"))?;
        let host = public.local_addr()?.ip();

        let mut table = HashMap::new();
        let mut mailboxes = Vec::new();
        let mut queues = HashMap::new();
        for id in &participants {
            let listener = TcpListener::bind((host, 0)).await?;
            table.insert(id.clone(), listener.local_addr()?);
            queues.insert(id.clone(), VecDeque::new());
            mailboxes.push((id.clone(), listener));
        }
        info!(participants = participants.len(), "mailboxes bound");
        debug!(?table, "address table");

        Ok(Self {
            public,
            mailboxes,
            table: Arc::new(serde_json::to_vec(&table)?),
            shared: Arc::new(Shared {
                queues: Mutex::new(queues),
                remaining: Mutex::new(participants.into_iter().collect()),
                done: Notify::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.public.local_addr()?)
    }

    /// Serve until every participant has said goodbye.
    pub async fn serve(self) -> anyhow::Result<()> {
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_public(self.public, self.table)));
        for (id, listener) in self.mailboxes {
            tasks.push(tokio::spawn(accept_mailbox(
                listener,
                id,
                Arc::clone(&self.shared),
            )));
        }

        loop {
            self.shared.done.notified().await;
            if self.shared.remaining.lock().await.is_empty() {
                break;
            }
        }
        info!("all participants have left, shutting down");
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

/// The public socket answers every poll with the address table.
async fn accept_public(listener: TcpListener, table: Arc<Vec<u8>>) {
    loop {
        let Ok((stream, addr)) = listener.accept().await else {
            continue;
        };
        let table = Arc::clone(&table);
        tokio::spawn(async move {
            if let Err(e) = serve_table(stream, &table).await {
                debug!(%addr, error = %e, "address table connection failed");
            }
        });
    }
}

async fn serve_table(mut stream: TcpStream, table: &[u8]) -> std::io::Result<()> {
    let mut header = [0u8; wire::HEADER_LEN];
    stream.read_exact(&mut header).await?;
    stream
        .write_all(&(table.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(table).await?;
    stream.flush().await
}

async fn accept_mailbox(listener: TcpListener, owner: String, shared: Arc<Shared>) {
    loop {
        let Ok((stream, addr)) = listener.accept().await else {
            continue;
        };
        let owner = owner.clone();
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            if let Err(e) = serve_mailbox(stream, &owner, &shared).await {
                debug!(%addr, mailbox = %owner, error = %e, "mailbox connection failed");
            }
        });
    }
}

async fn serve_mailbox(
    mut stream: TcpStream,
    owner: &str,
    shared: &Shared,
) -> std::io::Result<()> {
    let mut header = [0u8; wire::HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;

    if len == 0 {
        // Poll: hand over the next stored frame, or an empty header.
        let next = shared
            .queues
            .lock()
            .await
            .get_mut(owner)
            .and_then(VecDeque::pop_front);
        match next {
            Some(body) => {
                stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
                stream.write_all(&body).await?;
            }
            None => stream.write_all(&wire::POLL).await?,
        }
        return stream.flush().await;
    }

    if len > wire::MAX_FRAME_LEN {
        warn!(mailbox = %owner, len, "oversized frame dropped");
        return Ok(());
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    match wire::decode(&body) {
        Ok(ClientFrame::Post { sender, .. }) => {
            debug!(mailbox = %owner, from = %sender, "frame stored");
            shared
                .queues
                .lock()
                .await
                .entry(owner.to_string())
                .or_default()
                .push_back(body);
        }
        Ok(ClientFrame::Bye { sender }) => {
            info!(participant = %sender, "goodbye received");
            shared.remaining.lock().await.remove(&sender);
            shared.done.notify_one();
        }
        Err(e) => {
            // Undecodable mail is dropped; the sender's timeout recovers.
            warn!(mailbox = %owner, error = %e, "undecodable frame dropped");
        }
    }
    Ok(())
}
