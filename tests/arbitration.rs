// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! End-to-end arbitration scenarios against a live server: a real event
//! loop on its own thread, wire-speaking clients, and a temporary directory
//! standing in for the cpuset filesystem.

use anyhow::Result;
use arbiterd::poll;
use arbiterd::protocol::{self, Opcode, NUM_PRIORITIES};
use arbiterd::server::{ArbiterServer, Config};
use arbiterd::shmem::ShmemRegion;
use std::fs;
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    tmp: TempDir,
    term_fd: RawFd,
    handle: Option<JoinHandle<Result<()>>>,
}

fn start(exclusive: &[u32], preemption_timeout: Duration) -> Harness {
    let tmp = TempDir::new().unwrap();
    let cpuset_root = tmp.path().join("cpuset");
    fs::create_dir_all(&cpuset_root).unwrap();
    fs::write(cpuset_root.join("cpuset.cpus"), "0-7\n").unwrap();
    fs::write(cpuset_root.join("cpuset.mems"), "0\n").unwrap();
    fs::write(cpuset_root.join("tasks"), "").unwrap();

    let mut server = ArbiterServer::new(Config {
        socket_path: tmp.path().join("socket"),
        shmem_dir: tmp.path().join("shmem"),
        cpuset_root,
        exclusive_cpus: exclusive.to_vec(),
        preemption_timeout,
    })
    .unwrap();
    let term_fd = server.termination_fd();
    let handle = std::thread::spawn(move || server.run());

    Harness {
        tmp,
        term_fd,
        handle: Some(handle),
    }
}

impl Harness {
    fn connect(&self, tid: i32, pid: i32) -> Client {
        // the client creates and maps the shared region, then registers
        // with its path suffix
        let suffix = format!("shm_{}", pid);
        let shm = ShmemRegion::open(&self.tmp.path().join("shmem").join(&suffix)).unwrap();

        let mut stream = UnixStream::connect(self.tmp.path().join("socket")).unwrap();
        stream.set_read_timeout(Some(WAIT_TIMEOUT)).unwrap();
        stream
            .write_all(&protocol::encode_registration(tid, pid, &suffix))
            .unwrap();
        let mut resp = [0u8; 1];
        stream.read_exact(&mut resp).unwrap();
        assert_eq!(resp, [1]);

        Client { stream, shm }
    }

    fn shm_path(&self, pid: i32) -> PathBuf {
        self.tmp.path().join("shmem").join(format!("shm_{}", pid))
    }

    fn tasks_file(&self, name: &str) -> PathBuf {
        self.tmp.path().join("cpuset/arbiter").join(name).join("tasks")
    }

    fn tasks_contain(&self, name: &str, tid: i32) -> bool {
        fs::read_to_string(self.tasks_file(name))
            .map(|tasks| tasks.lines().any(|line| line.trim() == tid.to_string()))
            .unwrap_or(false)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            poll::notify_eventfd(self.term_fd);
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Client {
    stream: UnixStream,
    shm: ShmemRegion,
}

impl Client {
    fn request(&mut self, desired: [u32; NUM_PRIORITIES]) {
        let mut msg = vec![Opcode::CoreRequest as u8];
        msg.extend_from_slice(&protocol::encode_core_request(&desired));
        self.stream.write_all(&msg).unwrap();
    }

    fn block(&mut self) {
        self.stream.write_all(&[Opcode::ThreadBlock as u8]).unwrap();
    }

    /// Wait for the one-byte grant notification.
    fn wait_wakeup(&mut self) {
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, protocol::WAKEUP);
    }

    fn query(&mut self, op: Opcode) -> u32 {
        self.stream.write_all(&[op as u8]).unwrap();
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf).unwrap();
        u32::from_le_bytes(buf)
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("condition not reached within {:?}", WAIT_TIMEOUT);
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_single_process_grant() {
    let harness = start(&[4, 5, 6, 7], Duration::from_millis(10));
    let mut client = harness.connect(100, 1000);

    client.request([2, 0, 0, 0, 0, 0, 0, 0]);
    client.block();
    client.wait_wakeup();

    // granted in ascending CPU-id order
    wait_until(|| harness.tasks_contain("4", 100));
    assert_eq!(client.query(Opcode::TotalAvailable), 3);
    assert_eq!(client.query(Opcode::CountBlocked), 0);
}

#[test]
fn test_fifo_handoff() {
    let harness = start(&[4], Duration::from_secs(5));
    let mut a = harness.connect(100, 1000);
    a.request([1, 0, 0, 0, 0, 0, 0, 0]);
    a.block();
    a.wait_wakeup();

    let mut b = harness.connect(200, 2000);
    b.request([1, 0, 0, 0, 0, 0, 0, 0]);
    b.block();

    // nothing free: A is asked to release before B can run
    a.request([0; NUM_PRIORITIES]);
    wait_until(|| a.shm.release_requests() >= 1);
    a.block();

    b.wait_wakeup();
    wait_until(|| harness.tasks_contain("4", 200));
}

#[test]
fn test_voluntary_release_on_priority_pressure() {
    let harness = start(&[4], Duration::from_secs(5));
    let mut holder = harness.connect(100, 1000);
    holder.request([0, 0, 0, 1, 0, 0, 0, 0]);
    holder.block();
    holder.wait_wakeup();

    let mut requester = harness.connect(200, 2000);
    requester.block();
    requester.request([1, 0, 0, 0, 0, 0, 0, 0]);

    // the priority-3 holder owes the priority-0 requester one core
    wait_until(|| holder.shm.release_requests() == 1);
    assert!(!holder.shm.preempted());

    holder.block();
    requester.wait_wakeup();
    wait_until(|| harness.tasks_contain("4", 200));
}

#[test]
fn test_forced_preemption_on_timeout() {
    let harness = start(&[4], Duration::from_millis(25));
    let mut holder = harness.connect(100, 1000);
    holder.request([0, 0, 0, 1, 0, 0, 0, 0]);
    holder.block();
    holder.wait_wakeup();

    let mut requester = harness.connect(200, 2000);
    requester.block();
    requester.request([1, 0, 0, 0, 0, 0, 0, 0]);
    wait_until(|| holder.shm.release_requests() == 1);

    // the holder never blocks; the preemption timer does the job
    wait_until(|| holder.shm.preempted());
    wait_until(|| harness.tasks_contain("Unmanaged", 100));
    requester.wait_wakeup();
    wait_until(|| harness.tasks_contain("4", 200));
}

#[test]
fn test_rapid_demand_ramp() {
    let harness = start(&[4, 5, 6, 7], Duration::from_millis(10));
    let mut client = harness.connect(100, 1000);

    // 200 alternating requests; only the last one matters
    for _ in 0..25 {
        for n in (1..=4u32).chain((1..=4u32).rev()) {
            let mut desired = [0u32; NUM_PRIORITIES];
            desired[0] = n;
            client.request(desired);
        }
    }
    client.block();
    client.wait_wakeup();

    wait_until(|| harness.tasks_contain("4", 100));
    assert_eq!(client.query(Opcode::TotalAvailable), 3);
    assert_eq!(client.shm.release_requests(), 0);
}

#[test]
fn test_disconnect_returns_core_to_waiter() {
    let harness = start(&[4], Duration::from_millis(10));
    let mut a = harness.connect(100, 1000);
    a.request([1, 0, 0, 0, 0, 0, 0, 0]);
    a.block();
    a.wait_wakeup();

    let mut b = harness.connect(200, 2000);
    b.request([1, 0, 0, 0, 0, 0, 0, 0]);
    b.block();

    assert!(harness.shm_path(1000).exists());
    drop(a);

    b.wait_wakeup();
    wait_until(|| harness.tasks_contain("4", 200));
    // pid 1000 had a single thread, so its record and mapping went with it
    wait_until(|| !harness.shm_path(1000).exists());
}

#[test]
fn test_process_record_survives_other_threads() {
    let harness = start(&[4, 5], Duration::from_millis(10));
    let worker = harness.connect(100, 1000);
    let mut sibling = harness.connect(101, 1000);

    drop(worker);
    // the sibling keeps the process alive and the socket serviceable
    wait_until(|| harness.shm_path(1000).exists());
    assert_eq!(sibling.query(Opcode::TotalAvailable), 2);

    drop(sibling);
    wait_until(|| !harness.shm_path(1000).exists());
}

#[test]
fn test_clean_shutdown_tears_everything_down() {
    let mut harness = start(&[4, 5], Duration::from_millis(10));
    let mut client = harness.connect(100, 1000);
    client.request([1, 0, 0, 0, 0, 0, 0, 0]);
    client.block();
    client.wait_wakeup();

    harness.stop();

    assert!(!harness.tmp.path().join("cpuset/arbiter").exists());
    assert!(!harness.tmp.path().join("socket").exists());
    assert!(!harness.shm_path(1000).exists());
    // residual tasks went back to the cpuset root
    let root_tasks = fs::read_to_string(harness.tmp.path().join("cpuset/tasks")).unwrap();
    assert!(root_tasks.lines().any(|line| line.trim() == "100"));
}
