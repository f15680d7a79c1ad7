// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The arbiter server proper: a single-threaded event loop multiplexing the
//! listen socket, every client socket, every preemption timer and the
//! termination eventfd. All state lives behind one `&mut self`; invariants
//! are maintained between event handlers, never inside them.
//!
//! Cross-references between cores, threads and processes are ids and
//! indices: threads live in a map keyed by their socket fd, processes in a
//! map keyed by pid, cores in a fixed vector. No owning handle ever points
//! both ways.

use crate::cpuset::CpusetController;
use crate::poll::{Epoll, EventFd, TimerFd};
use crate::protocol::{self, Opcode, NUM_PRIORITIES};
use crate::shmem::ShmemRegion;
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PREEMPTION_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path of the listen socket.
    pub socket_path: PathBuf,
    /// Directory holding the per-process shared memory files.
    pub shmem_dir: PathBuf,
    /// Mount point of the cpuset filesystem.
    pub cpuset_root: PathBuf,
    /// CPUs to manage as exclusive cores.
    pub exclusive_cpus: Vec<u32>,
    /// Grace period before a non-cooperating thread is preempted.
    pub preemption_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum ThreadState {
    /// Granted an exclusive core and running on it.
    RunningExclusive,
    /// In the unmanaged pool, never blocked so far. Initial state.
    RunningUnmanaged,
    /// Forcibly moved off its exclusive core after a release timeout.
    RunningPreempted,
    /// Waiting on its socket for a core to become available.
    Blocked,
}

struct CoreInfo {
    cpu: u32,
    /// Socket fd of the thread running exclusively here.
    occupant: Option<RawFd>,
    /// Priority level the current grant satisfied.
    granted_at: Option<usize>,
    /// Stamp of the most recent grant, for least-recent tie-breaks.
    grant_seq: u64,
}

/// An accepted socket plus the bytes of a frame still in flight. Sockets are
/// non-blocking; a partial frame waits here for the next readiness event so
/// a stalled client never blocks the loop.
struct Connection {
    stream: UnixStream,
    rx: Vec<u8>,
}

struct ThreadInfo {
    tid: libc::pid_t,
    pid: libc::pid_t,
    stream: UnixStream,
    rx: Vec<u8>,
    /// Index into the core vector while RunningExclusive.
    core: Option<usize>,
    state: ThreadState,
}

enum SocketRead {
    /// Drained everything currently available.
    Data,
    /// Peer closed the connection.
    Closed,
    Error(std::io::Error),
}

struct ProcessInfo {
    shmem: ShmemRegion,
    /// Server-side mirror of the shared releaseRequestCount.
    release_requests: u64,
    /// Releases observed so far (voluntary, forced, or by disconnect).
    release_count: u64,
    total_cores_owned: u32,
    /// Cores held, attributed to the priority their grant satisfied.
    owned_at: [u32; NUM_PRIORITIES],
    desired: [u32; NUM_PRIORITIES],
    threads: HashSet<RawFd>,
    /// Blocked threads in blocking order; the longest-blocked is in front.
    blocked: VecDeque<RawFd>,
    preempted: BTreeSet<RawFd>,
    queued: [bool; NUM_PRIORITIES],
    /// At most one outstanding release request per process.
    release_timer: Option<RawFd>,
}

impl ProcessInfo {
    fn new(shmem: ShmemRegion) -> Self {
        Self {
            shmem,
            release_requests: 0,
            release_count: 0,
            total_cores_owned: 0,
            owned_at: [0; NUM_PRIORITIES],
            desired: [0; NUM_PRIORITIES],
            threads: HashSet::new(),
            blocked: VecDeque::new(),
            preempted: BTreeSet::new(),
            queued: [false; NUM_PRIORITIES],
            release_timer: None,
        }
    }

    fn owed_releases(&self) -> u64 {
        self.release_requests - self.release_count
    }

    fn total_desired(&self) -> u32 {
        self.desired.iter().sum()
    }
}

struct PendingRelease {
    pid: libc::pid_t,
    /// Core the release request referred to when it was issued.
    core: usize,
    timer: TimerFd,
}

pub struct ArbiterServer {
    socket_path: PathBuf,
    shmem_dir: PathBuf,
    preemption_timeout: Duration,
    listener: UnixListener,
    epoll: Epoll,
    term: EventFd,
    cpusets: CpusetController,
    cores: Vec<CoreInfo>,
    /// Indices of unoccupied cores; BTreeSet so grants walk ascending CPU id.
    free_cores: BTreeSet<usize>,
    /// Accepted connections that have not registered yet.
    pending: HashMap<RawFd, Connection>,
    threads: HashMap<RawFd, ThreadInfo>,
    processes: HashMap<libc::pid_t, ProcessInfo>,
    /// One FIFO per priority level; index 0 is the highest priority.
    queues: Vec<VecDeque<libc::pid_t>>,
    timers: HashMap<RawFd, PendingRelease>,
    grant_seq: u64,
}

impl ArbiterServer {
    pub fn new(cfg: Config) -> Result<Self> {
        if cfg.exclusive_cpus.is_empty() {
            bail!("no exclusive CPUs configured");
        }
        let mut cpus = cfg.exclusive_cpus.clone();
        cpus.sort_unstable();
        cpus.dedup();
        if cpus.len() != cfg.exclusive_cpus.len() {
            bail!("duplicate CPU ids in the exclusive core list");
        }

        let cpusets = CpusetController::new(&cfg.cpuset_root, &cpus)?;

        fs::create_dir_all(&cfg.shmem_dir).with_context(|| {
            format!("creating shared memory directory {}", cfg.shmem_dir.display())
        })?;

        if let Some(dir) = cfg.socket_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating socket directory {}", dir.display()))?;
        }
        let res = fs::remove_file(&cfg.socket_path);
        if let Err(e) = &res {
            if e.kind() != std::io::ErrorKind::NotFound {
                res.with_context(|| format!("deleting {}", cfg.socket_path.display()))?;
            }
        }
        let listener = UnixListener::bind(&cfg.socket_path)
            .with_context(|| format!("binding listen socket {}", cfg.socket_path.display()))?;
        // Clients are arbitrary local processes, not necessarily root.
        fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o777))
            .with_context(|| format!("opening up {}", cfg.socket_path.display()))?;

        let epoll = Epoll::new()?;
        let term = EventFd::new()?;
        epoll.add(listener.as_raw_fd())?;
        epoll.add(term.as_raw_fd())?;

        let cores: Vec<CoreInfo> = cpus
            .iter()
            .map(|&cpu| CoreInfo {
                cpu,
                occupant: None,
                granted_at: None,
                grant_seq: 0,
            })
            .collect();
        let free_cores = (0..cores.len()).collect();

        Ok(Self {
            socket_path: cfg.socket_path,
            shmem_dir: cfg.shmem_dir,
            preemption_timeout: cfg.preemption_timeout,
            listener,
            epoll,
            term,
            cpusets,
            cores,
            free_cores,
            pending: HashMap::new(),
            threads: HashMap::new(),
            processes: HashMap::new(),
            queues: vec![VecDeque::new(); NUM_PRIORITIES],
            timers: HashMap::new(),
            grant_seq: 0,
        })
    }

    /// Fd to write (e.g. from a signal handler) to stop arbitration.
    pub fn termination_fd(&self) -> RawFd {
        self.term.as_raw_fd()
    }

    pub fn run(&mut self) -> Result<()> {
        info!(
            "arbitration started: {} exclusive cores, socket {}",
            self.cores.len(),
            self.socket_path.display()
        );
        while self.handle_events()? {}
        self.end_arbitration()
    }

    /// Drain one batch of ready descriptors. Returns false once termination
    /// has been requested.
    fn handle_events(&mut self) -> Result<bool> {
        let ready = self.epoll.wait(-1)?;
        let mut keep_going = true;
        for (fd, events) in ready {
            if fd == self.term.as_raw_fd() {
                self.term.drain();
                info!("termination requested");
                keep_going = false;
            } else if fd == self.listener.as_raw_fd() {
                self.accept_connection();
            } else if self.timers.contains_key(&fd) {
                self.timeout_thread_preemption(fd);
            } else if self.pending.contains_key(&fd) || self.threads.contains_key(&fd) {
                let hup = (libc::EPOLLHUP | libc::EPOLLERR) as u32;
                if events & libc::EPOLLIN as u32 != 0 {
                    self.handle_socket(fd);
                } else if events & hup != 0 {
                    self.cleanup_connection(fd);
                }
            }
            // fds cleaned up earlier in this batch fall through silently
        }
        if !self.check_invariants() {
            debug_assert!(false, "server state invariants violated");
            self.reconcile();
        }
        Ok(keep_going)
    }

    fn end_arbitration(&mut self) -> Result<()> {
        info!("ending arbitration");
        let fds: Vec<RawFd> = self
            .threads
            .keys()
            .chain(self.pending.keys())
            .copied()
            .collect();
        for fd in fds {
            self.cleanup_connection(fd);
        }
        self.cpusets.teardown()?;
        let res = fs::remove_file(&self.socket_path);
        if let Err(e) = &res {
            if e.kind() != std::io::ErrorKind::NotFound {
                res.with_context(|| format!("deleting {}", self.socket_path.display()))?;
            }
        }
        Ok(())
    }

    fn accept_connection(&mut self) {
        match self.listener.accept() {
            Ok((stream, _)) => {
                // the single-threaded loop must never block on a read
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("cannot make new connection non-blocking: {}", e);
                    return;
                }
                let fd = stream.as_raw_fd();
                debug!("accepted connection on fd {}", fd);
                if let Err(e) = self.epoll.add(fd) {
                    warn!("cannot watch new connection: {:#}", e);
                    return;
                }
                self.pending.insert(
                    fd,
                    Connection {
                        stream,
                        rx: Vec::new(),
                    },
                );
            }
            Err(e) => warn!("failed to accept connection: {}", e),
        }
    }

    fn handle_socket(&mut self, fd: RawFd) {
        let drained = if let Some(conn) = self.pending.get_mut(&fd) {
            drain_socket(&mut conn.stream, &mut conn.rx)
        } else if let Some(thread) = self.threads.get_mut(&fd) {
            drain_socket(&mut thread.stream, &mut thread.rx)
        } else {
            return;
        };
        match drained {
            SocketRead::Data => {}
            SocketRead::Closed => {
                debug!("connection on fd {} closed", fd);
                self.cleanup_connection(fd);
                return;
            }
            SocketRead::Error(e) => {
                warn!("read error on fd {}: {}", fd, e);
                self.cleanup_connection(fd);
                return;
            }
        }

        if self.pending.contains_key(&fd) {
            if let Err(e) = self.register_thread(fd) {
                warn!("registration on fd {} failed: {:#}", fd, e);
                if let Some(conn) = self.pending.get_mut(&fd) {
                    let _ = conn.stream.write_all(&[0]);
                }
                self.cleanup_connection(fd);
            }
        } else {
            self.process_thread_messages(fd);
        }
    }

    /// Consume every complete opcode frame buffered on this thread's socket.
    /// A trailing partial frame waits for the next readiness event.
    fn process_thread_messages(&mut self, fd: RawFd) {
        loop {
            let next = {
                let Some(thread) = self.threads.get_mut(&fd) else { return };
                match thread.rx.first().copied() {
                    None => None,
                    Some(first) => match Opcode::try_from(first) {
                        Err(other) => Some(Err(other)),
                        Ok(opcode) => {
                            let frame_len = 1 + opcode.payload_len();
                            if thread.rx.len() < frame_len {
                                None
                            } else {
                                let payload: Vec<u8> =
                                    thread.rx.drain(..frame_len).skip(1).collect();
                                Some(Ok((opcode, payload)))
                            }
                        }
                    },
                }
            };
            match next {
                None => return,
                Some(Err(opcode)) => {
                    warn!("unknown opcode {} on fd {}", opcode, fd);
                    self.cleanup_connection(fd);
                    return;
                }
                Some(Ok((Opcode::ThreadBlock, _))) => self.thread_blocking(fd),
                Some(Ok((Opcode::CoreRequest, payload))) => {
                    let mut buf = [0u8; protocol::CORE_REQUEST_LEN];
                    buf.copy_from_slice(&payload);
                    self.cores_requested(fd, protocol::parse_core_request(&buf));
                }
                Some(Ok((Opcode::CountBlocked, _))) => {
                    let count = self
                        .processes
                        .values()
                        .map(|p| p.blocked.len() as u32)
                        .sum();
                    self.reply_u32(fd, count);
                }
                Some(Ok((Opcode::TotalAvailable, _))) => {
                    self.reply_u32(fd, self.free_cores.len() as u32);
                }
            }
        }
    }

    fn reply_u32(&mut self, fd: RawFd, value: u32) {
        let res = match self.threads.get_mut(&fd) {
            Some(thread) => thread.stream.write_all(&value.to_le_bytes()),
            None => return,
        };
        if let Err(e) = res {
            warn!("failed to answer query on fd {}: {}", fd, e);
            self.cleanup_connection(fd);
        }
    }

    /// First message on a fresh connection. Waits until the whole frame has
    /// been buffered; on success the fd graduates from the pending table
    /// into the thread table.
    fn register_thread(&mut self, fd: RawFd) -> Result<()> {
        let conn = self.pending.get_mut(&fd).unwrap();
        if conn.rx.len() < protocol::REGISTRATION_HEADER_LEN {
            return Ok(());
        }
        let mut header = [0u8; protocol::REGISTRATION_HEADER_LEN];
        header.copy_from_slice(&conn.rx[..protocol::REGISTRATION_HEADER_LEN]);
        let (tid, pid, path_len) = protocol::parse_registration_header(&header);
        if path_len == 0 || path_len > protocol::MAX_SHM_PATH_LEN {
            bail!("bad shared memory path length {}", path_len);
        }
        let frame_len = protocol::REGISTRATION_HEADER_LEN + path_len;
        if conn.rx.len() < frame_len {
            return Ok(());
        }
        let path_buf = conn.rx[protocol::REGISTRATION_HEADER_LEN..frame_len].to_vec();
        let suffix =
            std::str::from_utf8(&path_buf).context("shared memory path is not valid UTF-8")?;
        if suffix.contains('/') || suffix.contains('\0') || suffix == ".." {
            bail!("shared memory path {:?} escapes the shared memory directory", suffix);
        }

        // The process record is created by its first thread; later threads
        // of the same pid reuse the mapping it registered.
        if !self.processes.contains_key(&pid) {
            let shmem = ShmemRegion::open(&self.shmem_dir.join(suffix))?;
            self.processes.insert(pid, ProcessInfo::new(shmem));
            debug!("created process record for pid {}", pid);
        }

        let mut conn = self.pending.remove(&fd).unwrap();
        conn.rx.drain(..frame_len);
        self.processes.get_mut(&pid).unwrap().threads.insert(fd);
        self.threads.insert(
            fd,
            ThreadInfo {
                tid,
                pid,
                stream: conn.stream,
                rx: conn.rx,
                core: None,
                state: ThreadState::RunningUnmanaged,
            },
        );
        self.threads
            .get_mut(&fd)
            .unwrap()
            .stream
            .write_all(&[1])
            .context("sending registration response")?;
        info!("registered thread {} of process {}", tid, pid);
        // clients may pipeline their first requests behind the registration
        self.process_thread_messages(fd);
        Ok(())
    }

    /// The client announced it is about to block until granted a core. For
    /// an exclusive holder this is the voluntary half of a release request.
    fn thread_blocking(&mut self, fd: RawFd) {
        let Some(thread) = self.threads.get(&fd) else { return };
        let (tid, pid, state) = (thread.tid, thread.pid, thread.state);

        match state {
            ThreadState::Blocked => {
                warn!("thread {} is already blocked", tid);
                return;
            }
            ThreadState::RunningUnmanaged => {}
            ThreadState::RunningPreempted => {
                self.processes.get_mut(&pid).unwrap().preempted.remove(&fd);
            }
            ThreadState::RunningExclusive => {
                if self.processes[&pid].owed_releases() == 0 {
                    warn!("thread {} blocked without a pending release request", tid);
                }
                self.vacate_core(fd);
            }
        }

        self.threads.get_mut(&fd).unwrap().state = ThreadState::Blocked;
        self.processes.get_mut(&pid).unwrap().blocked.push_back(fd);
        debug!("thread {} of process {} blocked", tid, pid);
        self.distribute_cores();
    }

    /// The client rewrote its per-priority demand vector.
    fn cores_requested(&mut self, fd: RawFd, desired: [u32; NUM_PRIORITIES]) {
        let Some(thread) = self.threads.get(&fd) else { return };
        let pid = thread.pid;
        debug!("process {} requests {:?}", pid, desired);
        self.processes.get_mut(&pid).unwrap().desired = desired;
        self.refresh_queue_membership(pid);
        self.enforce_demand_limit(pid);
        self.distribute_cores();
    }

    /// Reconcile the priority queues with the process's unmet demand. A
    /// process enters queue p the first time it wants more at p (tail of the
    /// FIFO) and leaves as soon as that demand is met or withdrawn.
    fn refresh_queue_membership(&mut self, pid: libc::pid_t) {
        let Some(proc) = self.processes.get_mut(&pid) else { return };
        for p in 0..NUM_PRIORITIES {
            let wants = proc.desired[p] > proc.owned_at[p];
            if wants && !proc.queued[p] {
                proc.queued[p] = true;
                self.queues[p].push_back(pid);
            } else if !wants && proc.queued[p] {
                proc.queued[p] = false;
                self.queues[p].retain(|&q| q != pid);
            }
        }
    }

    /// A process holding more cores than its demand vector allows is asked
    /// to give one back, one request at a time.
    fn enforce_demand_limit(&mut self, pid: libc::pid_t) {
        let Some(proc) = self.processes.get(&pid) else { return };
        if proc.release_timer.is_some() {
            return;
        }
        let outstanding = proc.owed_releases() as u32;
        if proc.total_cores_owned.saturating_sub(outstanding) <= proc.total_desired() {
            return;
        }
        if let Some(core_idx) = self.pick_release_candidate(pid) {
            debug!("process {} holds more cores than it wants", pid);
            self.request_core_release(core_idx);
        }
    }

    /// The core this process should part with first: its lowest-priority,
    /// most recently granted one.
    fn pick_release_candidate(&self, pid: libc::pid_t) -> Option<usize> {
        self.cores
            .iter()
            .enumerate()
            .filter(|(_, core)| {
                core.occupant
                    .and_then(|fd| self.threads.get(&fd))
                    .map_or(false, |t| t.pid == pid)
            })
            .max_by_key(|(_, core)| (core.granted_at, core.grant_seq))
            .map(|(idx, _)| idx)
    }

    /// The policy engine. Walk priorities from highest to lowest handing out
    /// free cores in ascending CPU-id order; once everything is spoken for,
    /// see whether a lower-priority holder should be asked to release.
    fn distribute_cores(&mut self) {
        for p in 0..NUM_PRIORITIES {
            if self.free_cores.is_empty() {
                break;
            }
            let mut skips = 0;
            while !self.free_cores.is_empty() && skips < self.queues[p].len() {
                let Some(pid) = self.queues[p].pop_front() else { break };
                let Some(proc) = self.processes.get_mut(&pid) else {
                    continue;
                };
                if proc.desired[p] <= proc.owned_at[p] {
                    // stale entry
                    proc.queued[p] = false;
                    continue;
                }

                // Prefer the longest-blocked thread; otherwise promote a
                // preempted one back instead of churning cpusets further.
                let grantee = match proc.blocked.pop_front() {
                    Some(tfd) => Some((tfd, true)),
                    None => proc.preempted.pop_first().map(|tfd| (tfd, false)),
                };

                match grantee {
                    None => {
                        // nothing to put on a core right now; back of the line
                        self.queues[p].push_back(pid);
                        skips += 1;
                    }
                    Some((tfd, was_blocked)) => {
                        skips = 0;
                        let core_idx = self.free_cores.pop_first().unwrap();
                        self.grant_core(core_idx, tfd, p, was_blocked);
                        let proc = self.processes.get_mut(&pid).unwrap();
                        if proc.desired[p] > proc.owned_at[p] {
                            self.queues[p].push_back(pid);
                        } else {
                            proc.queued[p] = false;
                        }
                    }
                }
            }
        }

        if self.free_cores.is_empty() {
            self.request_release_if_starved();
        }
    }

    fn grant_core(&mut self, core_idx: usize, fd: RawFd, priority: usize, was_blocked: bool) {
        self.grant_seq += 1;
        let thread = self.threads.get_mut(&fd).unwrap();
        thread.state = ThreadState::RunningExclusive;
        thread.core = Some(core_idx);
        let (tid, pid) = (thread.tid, thread.pid);

        let core = &mut self.cores[core_idx];
        core.occupant = Some(fd);
        core.granted_at = Some(priority);
        core.grant_seq = self.grant_seq;
        let cpu = core.cpu;

        if let Err(e) = self.cpusets.move_thread_to_core(tid, cpu) {
            // the thread is as good as dead; its socket close will reclaim
            warn!("failed to move thread {} onto core {}: {:#}", tid, cpu, e);
        }

        let proc = self.processes.get_mut(&pid).unwrap();
        proc.total_cores_owned += 1;
        proc.owned_at[priority] += 1;
        debug!(
            "granted core {} to thread {} of process {} at priority {}",
            cpu, tid, pid, priority
        );

        if was_blocked {
            let thread = self.threads.get_mut(&fd).unwrap();
            if let Err(e) = thread.stream.write_all(&protocol::WAKEUP) {
                warn!("failed to wake thread {}: {}", tid, e);
            }
        }
    }

    /// Take `fd` off its exclusive core: unmanaged cpuset, core freed,
    /// bookkeeping updated. Counts as an observed release when one is owed.
    /// The caller decides the thread's next state.
    fn vacate_core(&mut self, fd: RawFd) {
        let Some(thread) = self.threads.get_mut(&fd) else { return };
        let Some(core_idx) = thread.core.take() else { return };
        let (tid, pid) = (thread.tid, thread.pid);

        let core = &mut self.cores[core_idx];
        let granted_at = core.granted_at.take();
        core.occupant = None;
        self.free_cores.insert(core_idx);

        if let Err(e) = self.cpusets.move_thread_to_unmanaged(tid) {
            warn!("failed to move thread {} to the unmanaged cpuset: {:#}", tid, e);
        }

        let proc = self.processes.get_mut(&pid).unwrap();
        proc.total_cores_owned -= 1;
        if let Some(p) = granted_at {
            proc.owned_at[p] -= 1;
        }
        if proc.owed_releases() > 0 {
            proc.release_count += 1;
            self.disarm_release_timer(pid);
        }
        self.refresh_queue_membership(pid);
        self.enforce_demand_limit(pid);
    }

    /// When demand at some priority is unmet and no core is free, ask the
    /// lowest-priority holder to give one back: the process with the most
    /// cores at the lowest level, ties broken by least recent grant. One
    /// request per pass keeps the system from thrashing.
    fn request_release_if_starved(&mut self) {
        let Some(unmet) = (0..NUM_PRIORITIES).find(|&p| !self.queues[p].is_empty()) else {
            return;
        };
        for level in ((unmet + 1)..NUM_PRIORITIES).rev() {
            // pid -> (cores granted at this level, oldest grant, oldest core)
            let mut holders: HashMap<libc::pid_t, (u32, u64, usize)> = HashMap::new();
            for (idx, core) in self.cores.iter().enumerate() {
                if core.granted_at != Some(level) {
                    continue;
                }
                let Some(fd) = core.occupant else { continue };
                let Some(thread) = self.threads.get(&fd) else { continue };
                let Some(proc) = self.processes.get(&thread.pid) else { continue };
                if proc.release_timer.is_some() {
                    continue;
                }
                let entry = holders.entry(thread.pid).or_insert((0, u64::MAX, idx));
                entry.0 += 1;
                if core.grant_seq < entry.1 {
                    entry.1 = core.grant_seq;
                    entry.2 = idx;
                }
            }
            let victim = holders
                .into_iter()
                .max_by_key(|&(_, (count, seq, _))| (count, Reverse(seq)));
            if let Some((_, (_, _, core_idx))) = victim {
                self.request_core_release(core_idx);
                return;
            }
        }
    }

    /// Bump the holder's shared releaseRequestCount and start the preemption
    /// clock for the recorded core.
    fn request_core_release(&mut self, core_idx: usize) {
        let Some(fd) = self.cores[core_idx].occupant else { return };
        let Some(pid) = self.threads.get(&fd).map(|t| t.pid) else { return };
        let Some(proc) = self.processes.get_mut(&pid) else { return };
        if proc.release_timer.is_some() {
            return;
        }

        let timer = match TimerFd::oneshot(self.preemption_timeout) {
            Ok(timer) => timer,
            Err(e) => {
                error!("failed to arm preemption timer: {:#}", e);
                return;
            }
        };
        let tfd = timer.as_raw_fd();
        if let Err(e) = self.epoll.add(tfd) {
            error!("failed to watch preemption timer: {:#}", e);
            return;
        }

        proc.release_requests += 1;
        proc.shmem.bump_release_requests();
        proc.release_timer = Some(tfd);
        self.timers.insert(
            tfd,
            PendingRelease {
                pid,
                core: core_idx,
                timer,
            },
        );
        debug!(
            "requested a core release from process {} (core {})",
            pid, self.cores[core_idx].cpu
        );
    }

    fn disarm_release_timer(&mut self, pid: libc::pid_t) {
        let Some(proc) = self.processes.get_mut(&pid) else { return };
        if let Some(tfd) = proc.release_timer.take() {
            let _ = self.epoll.del(tfd);
            // dropping the PendingRelease closes the timer fd
            self.timers.remove(&tfd);
        }
    }

    /// The release grace period expired without the process blocking.
    fn timeout_thread_preemption(&mut self, tfd: RawFd) {
        let Some(pending) = self.timers.remove(&tfd) else { return };
        pending.timer.ack();
        let _ = self.epoll.del(tfd);
        let (pid, recorded_core) = (pending.pid, pending.core);
        drop(pending);

        let Some(proc) = self.processes.get_mut(&pid) else { return };
        proc.release_timer = None;
        if proc.owed_releases() == 0 {
            debug!("release request to process {} was satisfied before the timeout", pid);
            return;
        }

        // Preempt on the recorded core if the process still occupies it;
        // otherwise pick its lowest-priority exclusive thread, leaving the
        // highest-priority level undisturbed when possible.
        let recorded = self.cores[recorded_core]
            .occupant
            .filter(|fd| self.threads.get(fd).map_or(false, |t| t.pid == pid));
        let victim = recorded.or_else(|| {
            self.processes[&pid]
                .threads
                .iter()
                .copied()
                .filter_map(|fd| {
                    let thread = self.threads.get(&fd)?;
                    let core_idx = thread.core?;
                    (thread.state == ThreadState::RunningExclusive).then_some((fd, core_idx))
                })
                .max_by_key(|&(_, idx)| (self.cores[idx].granted_at, self.cores[idx].grant_seq))
                .map(|(fd, _)| fd)
        });
        let Some(victim_fd) = victim else {
            debug!("process {} owes a release but holds no exclusive core", pid);
            return;
        };

        let tid = self.threads[&victim_fd].tid;
        warn!(
            "preempting thread {} of process {} after release timeout",
            tid, pid
        );
        self.processes[&pid].shmem.set_thread_preempted();
        self.vacate_core(victim_fd);
        self.threads.get_mut(&victim_fd).unwrap().state = ThreadState::RunningPreempted;
        self.processes
            .get_mut(&pid)
            .unwrap()
            .preempted
            .insert(victim_fd);
        self.distribute_cores();
    }

    /// The socket closed or faulted. Reclaim everything the thread held and
    /// destroy the process record with its last thread.
    fn cleanup_connection(&mut self, fd: RawFd) {
        if let Some(conn) = self.pending.remove(&fd) {
            let _ = self.epoll.del(fd);
            drop(conn);
            return;
        }
        let Some(thread) = self.threads.get(&fd) else { return };
        let (tid, pid, state) = (thread.tid, thread.pid, thread.state);
        debug!("cleaning up connection of thread {} (process {})", tid, pid);

        let _ = self.epoll.del(fd);
        if state == ThreadState::RunningExclusive {
            self.vacate_core(fd);
        }
        // closes the socket
        self.threads.remove(&fd);

        let proc = self.processes.get_mut(&pid).unwrap();
        proc.threads.remove(&fd);
        proc.blocked.retain(|&t| t != fd);
        proc.preempted.remove(&fd);

        if proc.threads.is_empty() {
            info!("process {} disconnected", pid);
            self.disarm_release_timer(pid);
            let proc = self.processes.remove(&pid).unwrap();
            for p in 0..NUM_PRIORITIES {
                if proc.queued[p] {
                    self.queues[p].retain(|&q| q != pid);
                }
            }
            let shm_path = proc.shmem.path().to_path_buf();
            // munmap before unlink
            drop(proc);
            let res = fs::remove_file(&shm_path);
            if let Err(e) = &res {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to unlink {}: {}", shm_path.display(), e);
                }
            }
        }

        self.distribute_cores();
    }

    /// Check the cross-structure invariants the allocator relies on. Logs
    /// every violation found; returns whether the state is consistent.
    fn check_invariants(&self) -> bool {
        let mut ok = true;
        let mut occupied = 0u32;

        for (idx, core) in self.cores.iter().enumerate() {
            match core.occupant {
                Some(fd) => {
                    occupied += 1;
                    if self.free_cores.contains(&idx) {
                        error!("core {} is both occupied and free", core.cpu);
                        ok = false;
                    }
                    if core.granted_at.is_none() {
                        error!("occupied core {} has no grant priority", core.cpu);
                        ok = false;
                    }
                    match self.threads.get(&fd) {
                        Some(t)
                            if t.core == Some(idx)
                                && t.state == ThreadState::RunningExclusive => {}
                        _ => {
                            error!("occupant of core {} does not point back at it", core.cpu);
                            ok = false;
                        }
                    }
                }
                None => {
                    if !self.free_cores.contains(&idx) {
                        error!("idle core {} is missing from the free set", core.cpu);
                        ok = false;
                    }
                }
            }
        }

        for (fd, thread) in &self.threads {
            if (thread.state == ThreadState::RunningExclusive) != thread.core.is_some() {
                error!("thread {} state and core linkage disagree", thread.tid);
                ok = false;
            }
            match self.processes.get(&thread.pid) {
                None => {
                    error!("thread {} has no process record", thread.tid);
                    ok = false;
                }
                Some(proc) => {
                    if !proc.threads.contains(fd) {
                        error!("thread {} is missing from its process", thread.tid);
                        ok = false;
                    }
                    if proc.blocked.contains(fd) != (thread.state == ThreadState::Blocked) {
                        error!("thread {} blocked partition is stale", thread.tid);
                        ok = false;
                    }
                    if proc.preempted.contains(fd)
                        != (thread.state == ThreadState::RunningPreempted)
                    {
                        error!("thread {} preempted partition is stale", thread.tid);
                        ok = false;
                    }
                }
            }
        }

        let mut total_owned = 0u32;
        for (pid, proc) in &self.processes {
            let exclusive = proc
                .threads
                .iter()
                .filter(|fd| {
                    self.threads
                        .get(fd)
                        .map_or(false, |t| t.state == ThreadState::RunningExclusive)
                })
                .count() as u32;
            if exclusive != proc.total_cores_owned {
                error!("process {} core ownership count is wrong", pid);
                ok = false;
            }
            if proc.owned_at.iter().sum::<u32>() != proc.total_cores_owned {
                error!("process {} per-priority ownership does not sum up", pid);
                ok = false;
            }
            if proc.release_count > proc.release_requests {
                error!("process {} released more cores than requested", pid);
                ok = false;
            }
            total_owned += proc.total_cores_owned;

            for p in 0..NUM_PRIORITIES {
                let wants = proc.desired[p] > proc.owned_at[p];
                if proc.queued[p] != wants {
                    error!("process {} queue membership at priority {} is stale", pid, p);
                    ok = false;
                }
                let entries = self.queues[p].iter().filter(|&&q| q == *pid).count();
                if entries != proc.queued[p] as usize {
                    error!("process {} appears {} times in queue {}", pid, entries, p);
                    ok = false;
                }
            }
        }

        if total_owned != occupied {
            error!(
                "{} cores owned by processes but {} cores occupied",
                total_owned, occupied
            );
            ok = false;
        }

        ok
    }

    /// Release-build repair path: rebuild every derived structure from the
    /// core-side view, which owns the ground truth of who runs where.
    fn reconcile(&mut self) {
        warn!("reconciling server state from core ownership");

        for thread in self.threads.values_mut() {
            if thread.state == ThreadState::RunningExclusive {
                thread.state = ThreadState::RunningUnmanaged;
                thread.core = None;
            }
        }

        self.free_cores.clear();
        for proc in self.processes.values_mut() {
            proc.total_cores_owned = 0;
            proc.owned_at = [0; NUM_PRIORITIES];
        }
        for (idx, core) in self.cores.iter_mut().enumerate() {
            let occupant = core.occupant.and_then(|fd| {
                self.threads.contains_key(&fd).then_some(fd)
            });
            match occupant {
                Some(fd) => {
                    let thread = self.threads.get_mut(&fd).unwrap();
                    thread.state = ThreadState::RunningExclusive;
                    thread.core = Some(idx);
                    let priority = core.granted_at.unwrap_or(NUM_PRIORITIES - 1);
                    core.granted_at = Some(priority);
                    if let Some(proc) = self.processes.get_mut(&thread.pid) {
                        proc.total_cores_owned += 1;
                        proc.owned_at[priority] += 1;
                    }
                }
                None => {
                    core.occupant = None;
                    core.granted_at = None;
                    self.free_cores.insert(idx);
                }
            }
        }

        let thread_states: HashMap<RawFd, ThreadState> = self
            .threads
            .iter()
            .map(|(fd, t)| (*fd, t.state))
            .collect();
        for proc in self.processes.values_mut() {
            proc.blocked
                .retain(|fd| thread_states.get(fd) == Some(&ThreadState::Blocked));
            proc.preempted
                .retain(|fd| thread_states.get(fd) == Some(&ThreadState::RunningPreempted));
        }

        let pids: Vec<libc::pid_t> = self.processes.keys().copied().collect();
        for p in 0..NUM_PRIORITIES {
            self.queues[p].clear();
        }
        for proc in self.processes.values_mut() {
            proc.queued = [false; NUM_PRIORITIES];
        }
        for pid in pids {
            self.refresh_queue_membership(pid);
        }
    }
}

/// Pull everything currently readable into the connection's receive buffer.
/// The socket is non-blocking, so this returns as soon as the kernel has
/// nothing more to give.
fn drain_socket(stream: &mut UnixStream, rx: &mut Vec<u8>) -> SocketRead {
    let mut chunk = [0u8; 512];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return SocketRead::Closed,
            Ok(n) => rx.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return SocketRead::Data,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return SocketRead::Error(e),
        }
    }
}
