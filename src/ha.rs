//! Master to slave replication of raw commit log bytes.
//!
//! Wire format, little-endian:
//!
//! ```text
//! master -> slave   physical offset u64 | body length u32 | body
//! slave  -> master  max physical offset u64
//! ```
//!
//! A frame with an empty body is a heartbeat. The slave reports its log end
//! right after connecting and after every applied frame; the master starts
//! streaming from that offset, or from the start of its newest segment when
//! the slave is empty.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::commit_log::CommitLog;
use crate::config::{BrokerRole, StoreConfig};
use crate::message::read_u64;
use crate::service::ServiceThread;
use crate::{Error, Result};

const HEADER_SIZE: usize = 12;
const ACK_SIZE: usize = 8;
const ACCEPT_POLL: Duration = Duration::from_millis(100);
const WRITER_IDLE_WAIT: Duration = Duration::from_millis(100);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_CHUNK: usize = 64 * 1024;

fn encode_header(offset: u64, len: u32) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[..8].copy_from_slice(&offset.to_le_bytes());
    out[8..].copy_from_slice(&len.to_le_bytes());
    out
}

struct HaShared {
    config: Arc<StoreConfig>,
    commit_log: Arc<CommitLog>,
    stopped: AtomicBool,
    // Highest offset any slave has acknowledged.
    push_to_slave_max_offset: Mutex<u64>,
    slave_acked: Condvar,
    // Bumped on every append so idle writers wake up.
    data_generation: Mutex<u64>,
    new_data: Condvar,
    connections: Mutex<Vec<Arc<HaConnection>>>,
}

impl HaShared {
    fn notify_transfer_some(&self, offset: u64) {
        if let Ok(mut pushed) = self.push_to_slave_max_offset.lock() {
            if offset > *pushed {
                *pushed = offset;
                self.slave_acked.notify_all();
            }
        }
    }

    fn data_generation(&self) -> u64 {
        self.data_generation.lock().map(|g| *g).unwrap_or(0)
    }

    fn wait_new_data(&self, seen: u64, timeout: Duration) {
        if let Ok(generation) = self.data_generation.lock() {
            let _ = self
                .new_data
                .wait_timeout_while(generation, timeout, |g| *g == seen);
        }
    }

    fn remove_connection(&self, conn: &Arc<HaConnection>) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.retain(|c| !Arc::ptr_eq(c, conn));
        }
    }
}

/// One slave attached to this master.
struct HaConnection {
    addr: SocketAddr,
    stream: TcpStream,
    stopped: AtomicBool,
    // First offset the slave reported, -1 until it has spoken.
    slave_request_offset: AtomicI64,
    slave_ack_offset: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HaConnection {
    fn close(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            log::info!("close ha connection to {}", self.addr);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn start(shared: &Arc<HaShared>, stream: TcpStream, addr: SocketAddr) -> Result<Arc<Self>> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(
            shared.config.ha_housekeeping_interval_ms,
        )))?;
        let reader_stream = stream.try_clone()?;
        let writer_stream = stream.try_clone()?;
        let conn = Arc::new(Self {
            addr,
            stream,
            stopped: AtomicBool::new(false),
            slave_request_offset: AtomicI64::new(-1),
            slave_ack_offset: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        });

        let (s, c) = (Arc::clone(shared), Arc::clone(&conn));
        let reader = thread::Builder::new()
            .name("ha-conn-reader".to_string())
            .spawn(move || run_reader(s, c, reader_stream))
            .map_err(Error::Io)?;
        let (s, c) = (Arc::clone(shared), Arc::clone(&conn));
        let writer = thread::Builder::new()
            .name("ha-conn-writer".to_string())
            .spawn(move || run_writer(s, c, writer_stream))
            .map_err(Error::Io)?;
        if let Ok(mut handles) = conn.handles.lock() {
            handles.push(reader);
            handles.push(writer);
        }
        Ok(conn)
    }

    fn join(&self) {
        let handles = self
            .handles
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_reader(shared: Arc<HaShared>, conn: Arc<HaConnection>, mut stream: TcpStream) {
    let mut ack = [0u8; ACK_SIZE];
    while !conn.stopped.load(Ordering::Acquire) {
        if let Err(err) = stream.read_exact(&mut ack) {
            if !conn.stopped.load(Ordering::Acquire) {
                log::warn!("ha reader for {} stops: {err}", conn.addr);
            }
            break;
        }
        let offset = u64::from_le_bytes(ack);
        conn.slave_ack_offset.store(offset, Ordering::Release);
        let _ = conn.slave_request_offset.compare_exchange(
            -1,
            offset as i64,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        shared.notify_transfer_some(offset);
    }
    conn.close();
    shared.remove_connection(&conn);
}

fn run_writer(shared: Arc<HaShared>, conn: Arc<HaConnection>, mut stream: TcpStream) {
    let request = loop {
        if conn.stopped.load(Ordering::Acquire) || shared.stopped.load(Ordering::Acquire) {
            conn.close();
            return;
        }
        let request = conn.slave_request_offset.load(Ordering::Acquire);
        if request >= 0 {
            break request as u64;
        }
        thread::sleep(Duration::from_millis(10));
    };
    let next = if request == 0 {
        let max = shared.commit_log.max_offset();
        max - max % shared.commit_log.mapped_file_size() as u64
    } else {
        request
    };
    log::info!("ha transfer to {} starts at {next}", conn.addr);

    if let Err(err) = stream_to_slave(&shared, &conn, &mut stream, next) {
        if !conn.stopped.load(Ordering::Acquire) {
            log::warn!("ha writer for {} stops: {err}", conn.addr);
        }
    }
    conn.close();
    shared.remove_connection(&conn);
}

fn stream_to_slave(
    shared: &HaShared,
    conn: &HaConnection,
    stream: &mut TcpStream,
    mut next: u64,
) -> std::io::Result<()> {
    let heartbeat = Duration::from_millis(shared.config.ha_send_heartbeat_interval_ms);
    let batch = shared.config.ha_transfer_batch_size.max(1);
    let mut last_write = Instant::now();
    while !conn.stopped.load(Ordering::Acquire) && !shared.stopped.load(Ordering::Acquire) {
        let seen = shared.data_generation();
        match shared.commit_log.get_data(next) {
            Some(buffer) => {
                let len = buffer.len().min(batch);
                stream.write_all(&encode_header(next, len as u32))?;
                stream.write_all(&buffer.as_slice()[..len])?;
                next += len as u64;
                last_write = Instant::now();
            }
            None => {
                if last_write.elapsed() >= heartbeat {
                    stream.write_all(&encode_header(next, 0))?;
                    last_write = Instant::now();
                }
                shared.wait_new_data(seen, WRITER_IDLE_WAIT);
            }
        }
    }
    Ok(())
}

/// Replication state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaClientState {
    Connecting,
    Transferring,
    Shutdown,
}

impl HaClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => HaClientState::Transferring,
            2 => HaClientState::Shutdown,
            _ => HaClientState::Connecting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HaClientState::Connecting => 0,
            HaClientState::Transferring => 1,
            HaClientState::Shutdown => 2,
        }
    }
}

struct ClientShared {
    config: Arc<StoreConfig>,
    commit_log: Arc<CommitLog>,
    master_address: Mutex<Option<String>>,
    state: AtomicU8,
}

impl ClientShared {
    fn set_state(&self, state: HaClientState) {
        let prev = self.state.swap(state.as_u8(), Ordering::AcqRel);
        if prev != state.as_u8() {
            log::info!("ha client {:?} -> {:?}", HaClientState::from_u8(prev), state);
        }
    }

    fn master_address(&self) -> Option<String> {
        self.master_address.lock().ok()?.clone()
    }

    fn connect(&self) -> Option<TcpStream> {
        let address = self.master_address()?;
        let addrs = match address.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => {
                log::warn!("resolve master {address} failed: {err}");
                return None;
            }
        };
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    log::info!("connected to master {addr}");
                    return Some(stream);
                }
                Err(err) => log::warn!("connect to master {addr} failed: {err}"),
            }
        }
        None
    }

    /// Applies frames until the connection fails, a gap shows up, or the
    /// client is stopped.
    fn transfer(&self, mut stream: TcpStream, stopped: &dyn Fn() -> bool) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
        let heartbeat = Duration::from_millis(self.config.ha_send_heartbeat_interval_ms);
        let housekeeping = Duration::from_millis(self.config.ha_housekeeping_interval_ms);

        let mut reported = self.commit_log.max_offset();
        stream.write_all(&reported.to_le_bytes())?;
        let mut last_report = Instant::now();
        let mut last_read = Instant::now();
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        while !stopped() {
            if last_report.elapsed() >= heartbeat {
                stream.write_all(&reported.to_le_bytes())?;
                last_report = Instant::now();
            }
            match stream.read(&mut chunk) {
                Ok(0) => return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "master closed")),
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    last_read = Instant::now();
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if last_read.elapsed() > housekeeping {
                        return Err(std::io::Error::new(ErrorKind::TimedOut, "master silent"));
                    }
                    continue;
                }
                Err(err) => return Err(err),
            }
            self.apply_frames(&mut pending)?;
            let max = self.commit_log.max_offset();
            if max > reported {
                reported = max;
                stream.write_all(&reported.to_le_bytes())?;
                last_report = Instant::now();
            }
        }
        Ok(())
    }

    fn apply_frames(&self, pending: &mut Vec<u8>) -> std::io::Result<()> {
        let mut consumed = 0;
        while pending.len() - consumed >= HEADER_SIZE {
            let frame = &pending[consumed..];
            let offset = read_u64(frame, 0).unwrap_or(0);
            let len = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
            if frame.len() < HEADER_SIZE + len {
                break;
            }
            let slave_max = self.commit_log.max_offset();
            if slave_max != 0 && slave_max != offset {
                log::error!("master pushed offset {offset} but slave log ends at {slave_max}");
                return Err(std::io::Error::new(ErrorKind::InvalidData, "replication gap"));
            }
            if len > 0 {
                let body = &frame[HEADER_SIZE..HEADER_SIZE + len];
                match self.commit_log.append_data(offset, body) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(std::io::Error::new(ErrorKind::InvalidData, "replication gap"))
                    }
                    Err(err) => return Err(std::io::Error::new(ErrorKind::Other, err.to_string())),
                }
            }
            consumed += HEADER_SIZE + len;
        }
        pending.drain(..consumed);
        Ok(())
    }
}

/// Master side (listener plus one connection per slave) and slave side
/// (client) of replication.
pub struct HaService {
    shared: Arc<HaShared>,
    client: Arc<ClientShared>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<ServiceThread>>,
    client_worker: Mutex<Option<ServiceThread>>,
}

impl HaService {
    pub fn new(config: Arc<StoreConfig>, commit_log: Arc<CommitLog>) -> Self {
        let client = Arc::new(ClientShared {
            config: Arc::clone(&config),
            commit_log: Arc::clone(&commit_log),
            master_address: Mutex::new(config.ha_master_address.clone()),
            state: AtomicU8::new(HaClientState::Connecting.as_u8()),
        });
        Self {
            shared: Arc::new(HaShared {
                config,
                commit_log,
                stopped: AtomicBool::new(false),
                push_to_slave_max_offset: Mutex::new(0),
                slave_acked: Condvar::new(),
                data_generation: Mutex::new(0),
                new_data: Condvar::new(),
                connections: Mutex::new(Vec::new()),
            }),
            client,
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
            client_worker: Mutex::new(None),
        }
    }

    /// Masters listen for slaves; slaves start the client.
    pub fn start(&self) -> Result<()> {
        match self.shared.config.broker_role {
            BrokerRole::Slave => self.start_client(),
            BrokerRole::AsyncMaster | BrokerRole::SyncMaster => self.start_listener(),
        }
    }

    fn start_listener(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.shared.config.ha_listen_port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        log::info!("ha service listening on {addr}");
        if let Ok(mut local) = self.local_addr.lock() {
            *local = Some(addr);
        }
        let shared = Arc::clone(&self.shared);
        let acceptor = ServiceThread::spawn("ha-accept", move |ctx| {
            while !ctx.is_stopped() {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        log::info!("ha service accepts slave {peer}");
                        match HaConnection::start(&shared, stream, peer) {
                            Ok(conn) => {
                                if let Ok(mut connections) = shared.connections.lock() {
                                    connections.push(conn);
                                }
                            }
                            Err(err) => log::warn!("start ha connection to {peer} failed: {err}"),
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        ctx.wait_for_running(ACCEPT_POLL);
                    }
                    Err(err) => {
                        log::warn!("ha accept failed: {err}");
                        ctx.wait_for_running(ACCEPT_POLL);
                    }
                }
            }
        })?;
        *self
            .acceptor
            .lock()
            .map_err(|_| Error::Corrupt("ha acceptor lock poisoned"))? = Some(acceptor);
        Ok(())
    }

    fn start_client(&self) -> Result<()> {
        let client = Arc::clone(&self.client);
        let worker = ServiceThread::spawn("ha-client", move |ctx| {
            let reconnect = Duration::from_millis(client.config.ha_reconnect_interval_ms);
            while !ctx.is_stopped() {
                client.set_state(HaClientState::Connecting);
                let Some(stream) = client.connect() else {
                    ctx.wait_for_running(reconnect);
                    continue;
                };
                client.set_state(HaClientState::Transferring);
                let closer = match stream.try_clone() {
                    Ok(closer) => closer,
                    Err(err) => {
                        log::warn!("clone master stream failed: {err}");
                        continue;
                    }
                };
                if let Err(err) = client.transfer(stream, &|| ctx.is_stopped()) {
                    log::warn!("ha client transfer stops: {err}");
                }
                let _ = closer.shutdown(Shutdown::Both);
            }
            client.set_state(HaClientState::Shutdown);
        })?;
        *self
            .client_worker
            .lock()
            .map_err(|_| Error::Corrupt("ha client lock poisoned"))? = Some(worker);
        Ok(())
    }

    /// Bound listener address, once started as a master.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().ok()?
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn push_to_slave_max_offset(&self) -> u64 {
        self.shared.push_to_slave_max_offset.lock().map(|p| *p).unwrap_or(0)
    }

    /// Bytes the slaves are behind the master.
    pub fn slave_fall_behind_much(&self) -> u64 {
        self.shared
            .commit_log
            .max_offset()
            .saturating_sub(self.push_to_slave_max_offset())
    }

    /// A slave is attached and close enough to wait for.
    pub fn is_slave_ok(&self, master_put_where: u64) -> bool {
        self.connection_count() > 0
            && master_put_where.saturating_sub(self.push_to_slave_max_offset())
                < self.shared.config.ha_slave_fall_behind_max
    }

    /// Blocks until a slave acknowledged `offset` or `timeout` passes.
    pub fn wait_for_slave_ack(&self, offset: u64, timeout: Duration) -> bool {
        let Ok(pushed) = self.shared.push_to_slave_max_offset.lock() else {
            return false;
        };
        match self
            .shared
            .slave_acked
            .wait_timeout_while(pushed, timeout, |pushed| *pushed < offset)
        {
            Ok((pushed, _)) => *pushed >= offset,
            Err(_) => false,
        }
    }

    /// Wakes idle connection writers after an append.
    pub fn notify_new_data(&self) {
        if let Ok(mut generation) = self.shared.data_generation.lock() {
            *generation = generation.wrapping_add(1);
            self.shared.new_data.notify_all();
        }
    }

    /// Sets the master the slave client connects to. Takes effect on the next
    /// reconnect.
    pub fn update_master_address(&self, address: &str) {
        if let Ok(mut current) = self.client.master_address.lock() {
            if current.as_deref() != Some(address) {
                log::info!("update master address {:?} -> {address}", current.as_deref());
                *current = Some(address.to_string());
            }
        }
    }

    pub fn master_address(&self) -> Option<String> {
        self.client.master_address()
    }

    pub fn client_state(&self) -> HaClientState {
        HaClientState::from_u8(self.client.state.load(Ordering::Acquire))
    }

    pub fn shutdown(&self, grace: Duration) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(acceptor) = self.acceptor.lock().ok().and_then(|mut a| a.take()) {
            acceptor.shutdown(grace);
        }
        if let Some(client) = self.client_worker.lock().ok().and_then(|mut c| c.take()) {
            client.shutdown(grace);
        }
        let connections = self
            .shared
            .connections
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default();
        self.shared.new_data.notify_all();
        for conn in connections {
            conn.close();
            conn.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StoreCheckpoint;
    use crate::clock::SystemClock;
    use crate::consume_queue::ConsumeQueueTable;
    use crate::dispatch::DispatchService;
    use crate::flags::RunningFlags;
    use crate::stats::StoreStats;
    use std::path::Path;
    use tempfile::tempdir;

    fn client(root: &Path) -> Result<ClientShared> {
        let config = Arc::new(StoreConfig {
            mapped_file_size_commit_log: 4096,
            mapped_file_entries_consume_queue: 64,
            broker_role: BrokerRole::Slave,
            ..StoreConfig::with_root(root)
        });
        let checkpoint = Arc::new(StoreCheckpoint::open(&config.checkpoint_path())?);
        let queues = Arc::new(ConsumeQueueTable::new(
            config.store_path_consume_queue(),
            config.mapped_file_size_consume_queue(),
        ));
        let flags = Arc::new(RunningFlags::new());
        let stats = Arc::new(StoreStats::new());
        let dispatcher = Arc::new(DispatchService::new(
            queues,
            None,
            Arc::clone(&checkpoint),
            Arc::clone(&flags),
            Arc::clone(&stats),
            1000,
        ));
        let commit_log = Arc::new(CommitLog::new(
            Arc::clone(&config),
            None,
            Arc::new(SystemClock),
            checkpoint,
            flags,
            stats,
            dispatcher,
        )?);
        commit_log.load()?;
        Ok(ClientShared {
            config,
            commit_log,
            master_address: Mutex::new(None),
            state: AtomicU8::new(HaClientState::Connecting.as_u8()),
        })
    }

    fn frame(offset: u64, body: &[u8]) -> Vec<u8> {
        let mut out = encode_header(offset, body.len() as u32).to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn frames_past_the_log_end_are_a_gap() -> Result<()> {
        let dir = tempdir()?;
        let client = client(dir.path())?;
        assert!(client.commit_log.append_data(0, &[1u8; 100])?);

        let mut pending = frame(200, &[2u8; 10]);
        let err = client.apply_frames(&mut pending).expect_err("gap");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(client.commit_log.max_offset(), 100);
        Ok(())
    }

    #[test]
    fn partial_frame_waits_for_the_rest() -> Result<()> {
        let dir = tempdir()?;
        let client = client(dir.path())?;
        assert!(client.commit_log.append_data(0, &[1u8; 100])?);

        let whole = frame(100, &[3u8; 10]);
        let mut pending = whole[..HEADER_SIZE + 5].to_vec();
        client.apply_frames(&mut pending)?;
        assert_eq!(pending.len(), HEADER_SIZE + 5);
        assert_eq!(client.commit_log.max_offset(), 100);

        pending.extend_from_slice(&whole[HEADER_SIZE + 5..]);
        pending.extend_from_slice(&frame(110, &[]));
        client.apply_frames(&mut pending)?;
        assert!(pending.is_empty());
        assert_eq!(client.commit_log.max_offset(), 110);
        Ok(())
    }

    #[test]
    fn reconnect_after_a_gap_reports_the_local_log_end() -> Result<()> {
        let dir = tempdir()?;
        let client = client(dir.path())?;
        assert!(client.commit_log.append_data(0, &[1u8; 110])?);
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;

        let read_report = |stream: &mut TcpStream| -> Result<u64> {
            let mut report = [0u8; ACK_SIZE];
            stream.read_exact(&mut report)?;
            Ok(u64::from_le_bytes(report))
        };

        thread::scope(|s| -> Result<()> {
            let first = s.spawn(|| client.transfer(TcpStream::connect(addr)?, &|| false));
            let (mut master, _) = listener.accept()?;
            assert_eq!(read_report(&mut master)?, 110);
            master.write_all(&frame(500, &[4u8; 4]))?;
            let err = first.join().expect("client thread").expect_err("gap");
            assert_eq!(err.kind(), ErrorKind::InvalidData);
            assert_eq!(client.commit_log.max_offset(), 110);

            let second = s.spawn(|| client.transfer(TcpStream::connect(addr)?, &|| false));
            let (mut master, _) = listener.accept()?;
            assert_eq!(read_report(&mut master)?, 110);
            master.write_all(&frame(110, &[5u8; 6]))?;
            assert_eq!(read_report(&mut master)?, 116);
            drop(master);
            let err = second.join().expect("client thread").expect_err("closed");
            assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
            Ok(())
        })?;
        assert_eq!(client.commit_log.max_offset(), 116);
        Ok(())
    }
}
