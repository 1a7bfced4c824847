use crate::cluster::Membership;
use crate::commands::{CommandExecutor, Outcome};
use crate::config::{memory_to_string, Config, Mode};
use crate::error::Result;
use crate::network::{Acceptor, ClientStream, Connection};
use crate::protocol::{decode_length, Header, Opcode, Request, Response, RC_OK};
use crate::session::SessionRegistry;
use crate::stats::ServerInfo;
use crate::storage::Store;
use bytes::Bytes;
use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WAKER: Token = Token(0);
const LISTENER: Token = Token(1);
const BUS: Token = Token(1);
const FIRST_CLIENT: usize = 2;

/// Bounded wait so every loop periodically observes the shutdown flag
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const READ_BUF_SIZE: usize = 8 * 1024;

/// The baton carrying one decoded request from an I/O worker to the command
/// pool; the reply travels back as an [`IoMsg::Reply`] to the owning worker.
struct IoEvent {
    session: u128,
    worker: usize,
    token: Token,
    header: Header,
    request: Request,
}

/// Messages delivered to an I/O worker's inbox
enum IoMsg {
    /// A freshly accepted connection handed over by the acceptor
    Accept(ClientStream, Option<SocketAddr>),
    /// A completed command for one of this worker's connections
    Reply(Token, Outcome),
}

/// Staged trie-database server.
///
/// One acceptor thread feeds N I/O workers; decoded requests cross to M
/// command workers over a shared channel and replies come back to the
/// owning worker. Each worker runs its own mio poll with a bounded timeout;
/// a connection belongs to exactly one I/O worker for its whole life, and
/// dispatches one request at a time, which keeps responses in request order.
pub struct Server {
    config: Config,
    store: Arc<Store>,
    stats: Arc<ServerInfo>,
    sessions: Arc<SessionRegistry>,
    cluster: Option<Arc<Membership>>,
    shutdown: AtomicBool,
    wakers: Mutex<Vec<Arc<Waker>>>,
    acceptor: Mutex<Option<Acceptor>>,
    local_addr: Option<SocketAddr>,
    seed: Mutex<Option<(String, u16)>>,
}

impl Server {
    /// Create a server and bind its listening socket.
    /// Binding eagerly surfaces startup failures before any thread spawns.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(crate::error::Error::Other)?;

        let (acceptor, local_addr) = match config.unix_socket.as_deref() {
            Some(path) => (Acceptor::bind_unix(path)?, None),
            None => {
                let (acceptor, addr) =
                    Acceptor::bind_tcp(&config.ip_address, config.ip_port, config.backlog())?;
                (acceptor, Some(addr))
            }
        };

        let cluster = match config.mode {
            Mode::Cluster => {
                let port = local_addr.map_or(config.ip_port, |a| a.port());
                Some(Arc::new(Membership::new(&config.ip_address, port)))
            }
            Mode::Standalone => None,
        };

        Ok(Self {
            config,
            store: Arc::new(Store::new()),
            stats: Arc::new(ServerInfo::new()),
            sessions: Arc::new(SessionRegistry::new()),
            cluster,
            shutdown: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
            acceptor: Mutex::new(Some(acceptor)),
            local_addr,
            seed: Mutex::new(None),
        })
    }

    /// Address actually bound (resolves port 0 requests); None for UNIX sockets
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Seed node to announce this node to at startup (cluster mode)
    pub fn set_seed(&self, host: &str, port: u16) {
        *self.seed.lock() = Some((host.to_string(), port));
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.count()
    }

    /// Signal every loop to unwind; `run` returns once all workers joined
    pub fn shutdown(&self) {
        info!("initiating server shutdown");
        self.shutdown.store(true, Ordering::Release);
        for waker in self.wakers.lock().iter() {
            let _ = waker.wake();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Run the server: spawn the worker pools and serve the accept loop on
    /// the calling thread until shutdown.
    pub fn run(self: Arc<Self>) -> Result<()> {
        let io_count = self.config.io_thread_count();
        let worker_count = self.config.worker_thread_count();

        match self.local_addr {
            Some(addr) => info!(%addr, "server listening"),
            None => info!(
                path = self.config.unix_socket.as_deref().unwrap_or(""),
                "server listening on unix socket"
            ),
        }
        info!(
            io_threads = io_count,
            worker_threads = worker_count,
            max_request_size = %memory_to_string(self.config.max_request_size_bytes()),
            "starting worker pools"
        );

        // Inbox channel + poll + waker per I/O worker
        let mut io_txs = Vec::with_capacity(io_count);
        let mut io_wakers = Vec::with_capacity(io_count);
        let mut io_setup = Vec::with_capacity(io_count);
        for _ in 0..io_count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
            let (tx, rx) = unbounded::<IoMsg>();
            self.wakers.lock().push(Arc::clone(&waker));
            io_txs.push(tx);
            io_wakers.push(waker);
            io_setup.push((poll, rx));
        }
        let io_txs = Arc::new(io_txs);
        let io_wakers = Arc::new(io_wakers);

        // Shared MPMC command channel: each event reaches exactly one worker
        let (cmd_tx, cmd_rx) = unbounded::<IoEvent>();

        // Cluster bus socket, owned by I/O worker 0
        let mut bus = None;
        if self.cluster.is_some() {
            let port = self
                .local_addr
                .map_or(self.config.bus_port(), |a| a.port().saturating_add(10_000));
            let addr: SocketAddr = format!("{}:{}", self.config.ip_address, port)
                .parse()
                .map_err(|e| {
                    std::io::Error::new(ErrorKind::InvalidInput, e)
                })?;
            bus = Some(UdpSocket::bind(addr)?);
            info!(%addr, "cluster bus listening");
        }

        let mut handles = Vec::new();

        for (id, (poll, inbox)) in io_setup.into_iter().enumerate() {
            let server = Arc::clone(&self);
            let cmd_tx = cmd_tx.clone();
            let bus = if id == 0 { bus.take() } else { None };
            handles.push(thread::spawn(move || {
                if let Err(e) = server.run_io_worker(id, poll, inbox, cmd_tx, bus) {
                    error!(worker = id, "I/O worker failed: {}", e);
                }
            }));
        }
        // Workers hold the only senders so the command channel disconnects
        // once the I/O pool unwinds
        drop(cmd_tx);

        let sweep_ticker = tick(Duration::from_millis(self.config.ttl_sweep_interval_ms));
        let reclaim_ticker = tick(Duration::from_secs(self.config.mem_reclaim_secs().max(1)));

        for id in 0..worker_count {
            let server = Arc::clone(&self);
            let cmd_rx = cmd_rx.clone();
            let io_txs = Arc::clone(&io_txs);
            let io_wakers = Arc::clone(&io_wakers);
            let sweep_rx = sweep_ticker.clone();
            let reclaim_rx = reclaim_ticker.clone();
            handles.push(thread::spawn(move || {
                server.run_command_worker(id, cmd_rx, io_txs, io_wakers, sweep_rx, reclaim_rx);
            }));
        }

        // Announce ourselves to the seed node once the bus is up
        if let Some(cluster) = &self.cluster {
            if let Some((host, port)) = self.seed.lock().clone() {
                match cluster.announce(&host, port) {
                    Ok(()) => info!(host = %host, port, "announced to seed node"),
                    Err(e) => warn!(host = %host, port, "seed announcement failed: {}", e),
                }
            }
        }

        self.run_acceptor(&io_txs, &io_wakers)?;

        for handle in handles {
            let _ = handle.join();
        }
        info!("server shutdown complete");
        Ok(())
    }

    /// Accept loop: runs on the caller's thread until shutdown
    fn run_acceptor(
        &self,
        io_txs: &[Sender<IoMsg>],
        io_wakers: &[Arc<Waker>],
    ) -> Result<()> {
        let mut poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        self.wakers.lock().push(waker);

        let mut acceptor = self
            .acceptor
            .lock()
            .take()
            .ok_or_else(|| crate::error::Error::System("server already running".into()))?;
        poll.registry()
            .register(&mut acceptor, LISTENER, Interest::READABLE)?;

        let mut events = Events::with_capacity(256);
        let mut next_worker = 0usize;

        while !self.is_shutdown() {
            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() != LISTENER {
                    continue;
                }
                loop {
                    match acceptor.accept() {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let worker = next_worker % io_txs.len();
                            next_worker = next_worker.wrapping_add(1);
                            debug!(?addr, worker, "accepted connection");
                            if io_txs[worker].send(IoMsg::Accept(stream, addr)).is_ok() {
                                let _ = io_wakers[worker].wake();
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        debug!("acceptor exiting");
        Ok(())
    }

    /// I/O worker loop: owns its connections, reads and decodes requests,
    /// writes replies handed back by the command pool.
    fn run_io_worker(
        &self,
        id: usize,
        mut poll: Poll,
        inbox: Receiver<IoMsg>,
        cmd_tx: Sender<IoEvent>,
        mut bus: Option<UdpSocket>,
    ) -> Result<()> {
        if let Some(bus) = bus.as_mut() {
            poll.registry().register(bus, BUS, Interest::READABLE)?;
        }

        let mut events = Events::with_capacity(1024);
        let mut connections: HashMap<Token, (ClientStream, Connection)> = HashMap::new();
        let mut next_token = FIRST_CLIENT;
        let mut buffer = vec![0u8; READ_BUF_SIZE];
        let max_request_size = self.config.max_request_size_bytes();

        info!(worker = id, "I/O worker started");

        while !self.is_shutdown() {
            if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            // Drain the inbox first: new connections and completed replies
            while let Ok(msg) = inbox.try_recv() {
                match msg {
                    IoMsg::Accept(mut stream, addr) => {
                        let token = Token(next_token);
                        next_token += 1;
                        if let Err(e) =
                            poll.registry().register(&mut stream, token, Interest::READABLE)
                        {
                            error!(worker = id, "failed to register client: {}", e);
                            continue;
                        }
                        let session = self.sessions.register(addr, id);
                        self.stats.client_connected();
                        let connection = Connection::new(session, max_request_size, addr);
                        connections.insert(token, (stream, connection));
                    }
                    IoMsg::Reply(token, outcome) => match outcome {
                        Outcome::Drop => {
                            self.close_connection(&poll, &mut connections, token);
                        }
                        Outcome::Reply(frame) => {
                            let close = match connections.get_mut(&token) {
                                Some((stream, connection)) => {
                                    connection.queue_reply(&frame);
                                    !self.flush_connection(
                                        &poll, stream, connection, token, id, &cmd_tx,
                                    )
                                }
                                None => false,
                            };
                            if close {
                                self.close_connection(&poll, &mut connections, token);
                            }
                        }
                    },
                }
            }

            for event in events.iter() {
                let token = event.token();

                if token == WAKER {
                    continue;
                }

                if bus.is_some() && token == BUS {
                    if let Some(bus) = bus.as_ref() {
                        self.drain_bus(bus, &mut buffer);
                    }
                    continue;
                }

                let mut close = false;
                if let Some((stream, connection)) = connections.get_mut(&token) {
                    if event.is_readable() {
                        close = !self.read_client(stream, connection, &mut buffer, token, id, &cmd_tx);
                    }
                    if !close && event.is_writable() && connection.has_pending_writes() {
                        close =
                            !self.flush_connection(&poll, stream, connection, token, id, &cmd_tx);
                    }
                } else {
                    continue;
                }

                if close {
                    self.close_connection(&poll, &mut connections, token);
                }
            }
        }

        // Unwind: dismantle every session this worker still owns
        let tokens: Vec<Token> = connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(&poll, &mut connections, token);
        }

        info!(worker = id, "I/O worker shutting down");
        Ok(())
    }

    /// Read everything available, then dispatch at most one decoded request.
    /// Returns false when the connection must be closed.
    fn read_client(
        &self,
        stream: &mut ClientStream,
        connection: &mut Connection,
        buffer: &mut [u8],
        token: Token,
        worker: usize,
        cmd_tx: &Sender<IoEvent>,
    ) -> bool {
        loop {
            match stream.read(buffer) {
                Ok(0) => return false,
                Ok(n) => {
                    self.stats.add_bytes_recv(n as u64);
                    connection.feed(&buffer[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != ErrorKind::ConnectionReset {
                        error!("read failed: {}", e);
                    }
                    return false;
                }
            }
        }

        self.dispatch_next(connection, token, worker, cmd_tx)
    }

    /// Hand the next buffered frame to the command pool, if the connection
    /// has no request in flight. False on a protocol error (drop client).
    fn dispatch_next(
        &self,
        connection: &mut Connection,
        token: Token,
        worker: usize,
        cmd_tx: &Sender<IoEvent>,
    ) -> bool {
        match connection.next_request() {
            Ok(Some((header, request))) => {
                self.sessions.touch(connection.session_id);
                let event = IoEvent {
                    session: connection.session_id,
                    worker,
                    token,
                    header,
                    request,
                };
                cmd_tx.send(event).is_ok()
            }
            Ok(None) => true,
            Err(e) => {
                warn!("protocol error, dropping client: {}", e);
                false
            }
        }
    }

    /// Push pending reply bytes out. On a complete write the connection is
    /// rearmed for input and the next buffered frame dispatched; a partial
    /// write arms the socket for output. False when the client must go.
    fn flush_connection(
        &self,
        poll: &Poll,
        stream: &mut ClientStream,
        connection: &mut Connection,
        token: Token,
        worker: usize,
        cmd_tx: &Sender<IoEvent>,
    ) -> bool {
        while let Some(data) = connection.pending_writes() {
            let len = data.len();
            match stream.write(data) {
                Ok(n) => {
                    self.stats.add_bytes_sent(n as u64);
                    connection.consume_writes(n);
                    if n < len {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("write failed: {}", e);
                    return false;
                }
            }
        }

        if connection.has_pending_writes() {
            let interest = Interest::READABLE | Interest::WRITABLE;
            if let Err(e) = poll.registry().reregister(stream, token, interest) {
                error!("failed to arm socket for output: {}", e);
                return false;
            }
            return true;
        }

        if connection.is_awaiting_reply() {
            connection.reply_done();
            if let Err(e) = poll.registry().reregister(stream, token, Interest::READABLE) {
                error!("failed to rearm socket for input: {}", e);
                return false;
            }
            // Pipelined frames may already be buffered
            return self.dispatch_next(connection, token, worker, cmd_tx);
        }

        true
    }

    fn close_connection(
        &self,
        poll: &Poll,
        connections: &mut HashMap<Token, (ClientStream, Connection)>,
        token: Token,
    ) {
        if let Some((mut stream, mut connection)) = connections.remove(&token) {
            let _ = poll.registry().deregister(&mut stream);
            connection.close();
            self.sessions.unregister(connection.session_id);
            self.stats.client_disconnected();
            debug!(session = %connection.session_id, "connection closed");
        }
    }

    /// Command worker loop: executes handlers under the store lock, runs the
    /// periodic expiration sweep and the advisory memory check.
    fn run_command_worker(
        &self,
        id: usize,
        cmd_rx: Receiver<IoEvent>,
        io_txs: Arc<Vec<Sender<IoMsg>>>,
        io_wakers: Arc<Vec<Arc<Waker>>>,
        sweep_rx: Receiver<std::time::Instant>,
        reclaim_rx: Receiver<std::time::Instant>,
    ) {
        let executor = CommandExecutor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.sessions),
            Arc::clone(&self.stats),
            self.cluster.clone(),
            self.config.clone(),
        );
        let max_memory = self.config.max_memory_bytes();

        info!(worker = id, "command worker started");

        loop {
            if self.is_shutdown() {
                break;
            }

            select! {
                recv(cmd_rx) -> msg => match msg {
                    Ok(event) => {
                        let outcome = executor.execute(event.session, event.header, event.request);
                        let worker = event.worker;
                        if io_txs[worker].send(IoMsg::Reply(event.token, outcome)).is_ok() {
                            let _ = io_wakers[worker].wake();
                        }
                    }
                    // All I/O workers are gone; nothing left to serve
                    Err(_) => break,
                },
                recv(sweep_rx) -> _ => {
                    let evicted = self.store.sweep_expired();
                    if evicted > 0 {
                        debug!(evicted, "expiration sweep");
                    }
                },
                recv(reclaim_rx) -> _ => {
                    let used = self.store.approx_memory();
                    if used > max_memory {
                        warn!(
                            used = %memory_to_string(used),
                            max = %memory_to_string(max_memory),
                            "keyspace memory above max_memory"
                        );
                    }
                },
            }
        }

        info!(worker = id, "command worker shutting down");
    }

    /// Handle every datagram pending on the cluster bus
    fn drain_bus(&self, bus: &UdpSocket, buffer: &mut [u8]) {
        loop {
            match bus.recv_from(buffer) {
                Ok((n, from)) => self.handle_bus_datagram(bus, &buffer[..n], from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("bus receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_bus_datagram(&self, bus: &UdpSocket, raw: &[u8], from: SocketAddr) {
        if raw.len() < 2 {
            return;
        }
        let Ok(header) = Header::from_byte(raw[0]) else {
            return;
        };
        let Ok(Some((body_len, len_bytes))) = decode_length(&raw[1..]) else {
            return;
        };
        if raw.len() < 1 + len_bytes + body_len {
            return;
        }
        let body = Bytes::copy_from_slice(&raw[1 + len_bytes..1 + len_bytes + body_len]);

        if header.request {
            match Request::decode(header, &body) {
                Ok(Request::Join { host, port }) => {
                    if let Some(cluster) = &self.cluster {
                        if cluster.add(&host, port) {
                            self.stats.node_seen();
                        }
                        let ack = Response::Ack(RC_OK).encode(Opcode::Ack, false);
                        let _ = bus.send_to(&ack, from);
                    }
                }
                Ok(other) => debug!(opcode = ?other.opcode(), "ignoring bus request"),
                Err(e) => warn!("malformed bus frame from {}: {}", from, e),
            }
        } else {
            debug!(%from, "bus acknowledgement");
        }
    }
}
