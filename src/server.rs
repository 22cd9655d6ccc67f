use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
    sync::{mpsc, Mutex},
    time,
};
use tracing::{debug, info, warn};

use crate::{
    hub::{Hub, ParticipantHandle, RegisterError, RenameError},
    protocol::{self, Command},
};

/// Tunables for a relay instance. The idle window reproduces the classic
/// three-minute eviction policy by default; tests shrink it.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3 * 60),
        }
    }
}

/// Accepts TCP connections and runs one chat session per participant.
pub struct RelayServer {
    listener: TcpListener,
    config: RelayConfig,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self { listener, config }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until `shutdown` resolves. Individual connection
    /// failures never take the server down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer { listener, config } = self;
        let hub = Hub::spawn();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    handle_accept_result(accepted, &hub, &config);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    hub: &Arc<Hub>,
    config: &RelayConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, hub, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, hub: &Arc<Hub>, config: &RelayConfig) {
    let hub = Arc::clone(hub);
    let config = config.clone();
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, hub, config).await {
            warn!(peer = %peer, error = ?err, "session closed with error");
        }
    });
}

/// How a session came to its end.
enum SessionEnd {
    /// The peer closed the connection or the read half failed.
    Disconnected,
    /// The idle watchdog fired.
    Evicted,
}

/// One connected participant: their place in the hub plus the mailbox used
/// for lines addressed straight to them (replies, listings, private
/// messages).
struct Session {
    hub: Arc<Hub>,
    addr: SocketAddr,
    /// Current display name. The registry key moves together with this value,
    /// so the lock is held across the registry call during a rename and the
    /// final unregister.
    name: Mutex<String>,
    mailbox: mpsc::UnboundedSender<String>,
}

impl Session {
    /// Registers the participant under its socket address and announces the
    /// arrival. Addresses are unique per connection, so this cannot collide
    /// with another live session.
    async fn join(
        hub: Arc<Hub>,
        addr: SocketAddr,
        mailbox: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<Self>, RegisterError> {
        let name = addr.to_string();
        hub.register(&name, ParticipantHandle::new(addr, mailbox.clone()))
            .await?;
        hub.publish(&name, addr, protocol::JOIN_ANNOUNCEMENT);
        Ok(Arc::new(Self {
            hub,
            addr,
            name: Mutex::new(name),
            mailbox,
        }))
    }

    /// Queues a line for this participant only.
    fn deliver(&self, line: String) {
        if self.mailbox.send(line).is_err() {
            debug!(peer = %self.addr, "own mailbox closed, dropping reply");
        }
    }

    /// Executes one parsed inbound line. Errors are answered on the sender's
    /// own mailbox and never end the session.
    async fn apply(&self, command: Command) {
        match command {
            Command::Who => self.list_online().await,
            Command::Rename { new_name } => self.rename(new_name).await,
            Command::Direct { recipient, body } => self.direct_message(recipient, body).await,
            Command::Broadcast { text } => {
                let name = self.name.lock().await;
                self.hub.publish(&name, self.addr, &text);
            }
        }
    }

    /// Answers `who` with one line per online participant, including the
    /// requester. The listing goes straight to the requester's mailbox, never
    /// through the broadcast queue.
    async fn list_online(&self) {
        for (name, handle) in self.hub.snapshot().await {
            self.deliver(protocol::online_line(&name, handle.addr()));
        }
    }

    async fn rename(&self, new_name: String) {
        let mut name = self.name.lock().await;
        match self.hub.rename(&name, &new_name).await {
            Ok(()) => {
                *name = new_name;
                self.deliver(protocol::rename_ok_line(&name));
            }
            Err(RenameError::NameTaken) => {
                self.deliver(protocol::REPLY_NAME_TAKEN.to_string());
            }
            // The entry is already gone, so this session is being torn down;
            // there is nobody left to answer.
            Err(RenameError::Gone) => {}
        }
    }

    /// Delivers a private line to exactly one recipient, bypassing the
    /// broadcast queue. The recipient lookup comes first so an unknown name
    /// is reported even when the body is empty.
    async fn direct_message(&self, recipient: String, body: String) {
        if recipient.is_empty() {
            self.deliver(protocol::REPLY_BAD_DIRECT_FORMAT.to_string());
            return;
        }
        let Some(handle) = self.hub.lookup(&recipient).await else {
            self.deliver(protocol::REPLY_NO_SUCH_USER.to_string());
            return;
        };
        if body.is_empty() {
            self.deliver(protocol::REPLY_EMPTY_BODY.to_string());
            return;
        }
        let name = self.name.lock().await;
        handle.deliver(protocol::direct_line(&name, &body));
    }

    /// Removes the participant and announces the departure. Idempotent: once
    /// the entry is gone (for example after a rename raced with eviction and
    /// lost), nothing further happens.
    async fn leave(&self) {
        let name = self.name.lock().await;
        if self.hub.unregister(&name).await.is_some() {
            self.hub.publish(&name, self.addr, protocol::LEAVE_ANNOUNCEMENT);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    config: RelayConfig,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let delivery = tokio::spawn(deliver_mailbox(mailbox_rx, write_half, peer));

    let session = match Session::join(hub, peer, mailbox_tx).await {
        Ok(session) => session,
        Err(RegisterError::NameTaken) => {
            // Only possible while a previous session for the same address is
            // still tearing down; drop the newcomer rather than corrupt the
            // registry.
            warn!(peer = %peer, "address already registered, dropping connection");
            let _ = delivery.await;
            return Ok(());
        }
    };
    info!(peer = %peer, "participant joined");

    let (activity_tx, activity_rx) = mpsc::channel(1);
    let reader = tokio::spawn(read_loop(
        Arc::clone(&session),
        BufReader::new(read_half),
        activity_tx,
    ));

    let end = watch_idle(activity_rx, config.idle_timeout).await;
    if let SessionEnd::Evicted = end {
        session.deliver(protocol::EVICTION_NOTICE.to_string());
        reader.abort();
    }
    match reader.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(peer = %peer, error = ?err, "read loop ended with error"),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(peer = %peer, error = ?err, "read loop panicked"),
    }

    session.leave().await;
    match end {
        SessionEnd::Evicted => info!(peer = %peer, "participant evicted after idle timeout"),
        SessionEnd::Disconnected => info!(peer = %peer, "participant disconnected"),
    }

    // Dropping the session releases the last mailbox sender; the delivery
    // task drains what is queued (the eviction notice included) and closes
    // the write half.
    drop(session);
    let _ = delivery.await;
    Ok(())
}

/// Reads inbound lines, runs each one, and raises an activity signal per
/// line. Returns on end of stream or a transport fault; either way the
/// caller runs the shared teardown path.
async fn read_loop(
    session: Arc<Session>,
    mut reader: BufReader<OwnedReadHalf>,
    activity: mpsc::Sender<()>,
) -> io::Result<()> {
    loop {
        let line = match protocol::read_line(&mut reader).await? {
            Some(line) => line,
            None => return Ok(()),
        };
        session.apply(protocol::parse_command(&line)).await;
        // Any complete inbound line counts as activity for the watchdog.
        let _ = activity.send(()).await;
    }
}

/// Two-arm wait, re-armed after every activity signal: either the connection
/// stays active (the read loop keeps signalling), or the idle window elapses
/// and the participant is evicted. A dropped sender means the read loop is
/// done and the session ended on its own.
async fn watch_idle(mut activity: mpsc::Receiver<()>, idle_timeout: Duration) -> SessionEnd {
    loop {
        select! {
            signal = activity.recv() => match signal {
                Some(()) => continue,
                None => return SessionEnd::Disconnected,
            },
            _ = time::sleep(idle_timeout) => return SessionEnd::Evicted,
        }
    }
}

/// Delivery task: one transport write per queued line, so a stalled peer
/// backs up only its own mailbox. Ends once the mailbox closes and has been
/// drained; dropping the write half closes the connection.
async fn deliver_mailbox(
    mut mailbox: mpsc::UnboundedReceiver<String>,
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
) {
    while let Some(line) = mailbox.recv().await {
        if let Err(err) = protocol::write_line(&mut writer, &line).await {
            debug!(peer = %peer, error = ?err, "failed to deliver line");
            break;
        }
    }
}
