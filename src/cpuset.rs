// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Cpuset hierarchy management.
//!
//! The arbiter owns a small cgroup-v1 cpuset subtree: `arbiter/` spans every
//! CPU, `arbiter/Unmanaged/` holds the non-exclusive remainder and is where
//! all uninteresting work is funnelled, and `arbiter/<cpu>/` pins exactly one
//! exclusive CPU each. Threads are granted and revoked cores by writing
//! their tid into the matching `tasks` file.
//!
//! The controller is rooted at an arbitrary path (the real mount point in
//! production, a temporary directory in tests).

use crate::cpulist;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use std::collections::HashMap;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const ARBITER_DIR: &str = "arbiter";
const UNMANAGED_DIR: &str = "Unmanaged";

pub struct CpusetController {
    root: PathBuf,
    arbiter_path: PathBuf,
    unmanaged_cpus: Vec<u32>,
    unmanaged_tasks: File,
    core_tasks: HashMap<u32, File>,
}

impl CpusetController {
    /// Build the arbiter cpuset hierarchy under `root` and funnel every task
    /// currently on the machine into the unmanaged pool. Any subtree left
    /// over from a previous run is swept away first. All failures here are
    /// fatal: the machine is misconfigured.
    pub fn new(root: &Path, exclusive_cpus: &[u32]) -> Result<Self> {
        let all_cpus = cpulist::parse(
            &fs::read_to_string(root.join("cpuset.cpus")).with_context(|| {
                format!("cpuset filesystem not mounted at {}", root.display())
            })?,
        )?;
        let mems = fs::read_to_string(root.join("cpuset.mems"))
            .with_context(|| format!("reading {}/cpuset.mems", root.display()))?
            .trim()
            .to_string();

        for cpu in exclusive_cpus {
            if !all_cpus.contains(cpu) {
                bail!("exclusive CPU {} is not available under {}", cpu, root.display());
            }
        }
        let unmanaged_cpus: Vec<u32> = all_cpus
            .iter()
            .copied()
            .filter(|cpu| !exclusive_cpus.contains(cpu))
            .collect();
        if unmanaged_cpus.is_empty() {
            bail!("every CPU is marked exclusive, nothing left for the unmanaged pool");
        }

        let arbiter_path = root.join(ARBITER_DIR);
        Self::drain_and_remove(root, &arbiter_path)?;

        Self::create_cpuset(&arbiter_path, &cpulist::format(&all_cpus), &mems)?;
        let unmanaged_path = arbiter_path.join(UNMANAGED_DIR);
        Self::create_cpuset(&unmanaged_path, &cpulist::format(&unmanaged_cpus), &mems)?;
        let unmanaged_tasks = Self::open_tasks(&unmanaged_path)?;

        let mut core_tasks = HashMap::new();
        for &cpu in exclusive_cpus {
            let core_path = arbiter_path.join(cpu.to_string());
            Self::create_cpuset(&core_path, &cpu.to_string(), &mems)?;
            core_tasks.insert(cpu, Self::open_tasks(&core_path)?);
        }

        // Everything already running on the machine moves off the exclusive
        // CPUs before the first grant.
        Self::move_tasks(&root.join("tasks"), &unmanaged_path.join("tasks"))
            .context("migrating existing tasks into the unmanaged cpuset")?;

        info!(
            "cpuset hierarchy ready: exclusive [{}], unmanaged [{}]",
            cpulist::format(exclusive_cpus),
            cpulist::format(&unmanaged_cpus)
        );

        Ok(Self {
            root: root.to_path_buf(),
            arbiter_path,
            unmanaged_cpus,
            unmanaged_tasks,
            core_tasks,
        })
    }

    pub fn unmanaged_cpus(&self) -> &[u32] {
        &self.unmanaged_cpus
    }

    fn create_cpuset(dir: &Path, cpus: &str, mems: &str) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("creating cpuset {}", dir.display()))?;
        fs::write(dir.join("cpuset.cpus"), cpus)
            .with_context(|| format!("assigning CPUs {} to {}", cpus, dir.display()))?;
        fs::write(dir.join("cpuset.mems"), mems)
            .with_context(|| format!("assigning memory nodes to {}", dir.display()))?;
        Ok(())
    }

    /// Keep the task-injection file open for the controller's lifetime; one
    /// write per migration. The file exists on a real cpuset mount and is
    /// created for plain-directory roots.
    fn open_tasks(dir: &Path) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .open(dir.join("tasks"))
            .with_context(|| format!("opening {}/tasks", dir.display()))
    }

    /// Drain every task listed in `src` into `dst`, one write per pid. Tasks
    /// that exited between the read and the write are skipped, never errors.
    fn move_tasks(src: &Path, dst: &Path) -> Result<()> {
        let pids = match fs::read_to_string(src) {
            Ok(pids) => pids,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", src.display())),
        };
        let mut dst_file = OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .open(dst)
            .with_context(|| format!("opening {}", dst.display()))?;
        for pid in pids.lines() {
            let pid = pid.trim();
            if pid.is_empty() {
                continue;
            }
            if let Err(e) = dst_file.write_all(format!("{}\n", pid).as_bytes()) {
                debug!("skipping task {}: {}", pid, e);
            }
        }
        Ok(())
    }

    /// Remove the arbiter subtree, returning its tasks to the cpuset root.
    fn drain_and_remove(root: &Path, arbiter_path: &Path) -> Result<()> {
        if !arbiter_path.exists() {
            return Ok(());
        }
        let root_tasks = root.join("tasks");
        for entry in fs::read_dir(arbiter_path)
            .with_context(|| format!("reading {}", arbiter_path.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let _ = Self::move_tasks(&entry.path().join("tasks"), &root_tasks);
                Self::remove_cpuset(&entry.path())?;
            }
        }
        let _ = Self::move_tasks(&arbiter_path.join("tasks"), &root_tasks);
        Self::remove_cpuset(arbiter_path)?;
        Ok(())
    }

    /// A kernel cpuset goes away with a bare rmdir; its control files are
    /// virtual. Plain-directory roots carry real control files that have to
    /// be removed first.
    fn remove_cpuset(dir: &Path) -> Result<()> {
        if fs::remove_dir(dir).is_ok() {
            return Ok(());
        }
        for name in ["cpuset.cpus", "cpuset.mems", "tasks"] {
            let _ = fs::remove_file(dir.join(name));
        }
        fs::remove_dir(dir).with_context(|| format!("removing cpuset {}", dir.display()))
    }

    pub fn move_thread_to_core(&mut self, tid: libc::pid_t, cpu: u32) -> Result<()> {
        let file = self
            .core_tasks
            .get_mut(&cpu)
            .ok_or_else(|| anyhow!("no exclusive cpuset for CPU {}", cpu))?;
        Self::write_task(file, tid)
    }

    pub fn move_thread_to_unmanaged(&mut self, tid: libc::pid_t) -> Result<()> {
        Self::write_task(&mut self.unmanaged_tasks, tid)
    }

    fn write_task(file: &mut File, tid: libc::pid_t) -> Result<()> {
        match file.write_all(format!("{}\n", tid).as_bytes()) {
            Ok(()) => Ok(()),
            // the thread exited before the write landed
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                debug!("task {} vanished before the cpuset move", tid);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("moving task {} between cpusets", tid)),
        }
    }

    /// Tear the hierarchy down and return all residual tasks to the root.
    pub fn teardown(&mut self) -> Result<()> {
        info!("tearing down arbiter cpusets");
        Self::drain_and_remove(&self.root, &self.arbiter_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_root(cpus: &str) -> TempDir {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("cpuset.cpus"), cpus).unwrap();
        fs::write(tmp.path().join("cpuset.mems"), "0\n").unwrap();
        fs::write(tmp.path().join("tasks"), "").unwrap();
        tmp
    }

    fn read_tasks(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_setup_creates_hierarchy() {
        let tmp = fake_root("0-7\n");
        let ctl = CpusetController::new(tmp.path(), &[4, 5, 6, 7]).unwrap();

        let arbiter = tmp.path().join("arbiter");
        assert_eq!(
            fs::read_to_string(arbiter.join("cpuset.cpus")).unwrap(),
            "0-7"
        );
        assert_eq!(
            fs::read_to_string(arbiter.join("Unmanaged/cpuset.cpus")).unwrap(),
            "0-3"
        );
        for cpu in 4..8 {
            assert_eq!(
                fs::read_to_string(arbiter.join(cpu.to_string()).join("cpuset.cpus")).unwrap(),
                cpu.to_string()
            );
            assert_eq!(
                fs::read_to_string(arbiter.join(cpu.to_string()).join("cpuset.mems")).unwrap(),
                "0"
            );
        }
        assert_eq!(ctl.unmanaged_cpus(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_setup_migrates_existing_tasks() {
        let tmp = fake_root("0-3\n");
        fs::write(tmp.path().join("tasks"), "100\n101\n").unwrap();
        CpusetController::new(tmp.path(), &[2, 3]).unwrap();

        assert_eq!(
            read_tasks(&tmp.path().join("arbiter/Unmanaged/tasks")),
            vec!["100", "101"]
        );
    }

    #[test]
    fn test_setup_sweeps_stale_hierarchy() {
        let tmp = fake_root("0-3\n");
        let stale = tmp.path().join("arbiter/3");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("tasks"), "42\n").unwrap();

        CpusetController::new(tmp.path(), &[2, 3]).unwrap();

        // the stale occupant went back to the root before the rebuild
        assert!(read_tasks(&tmp.path().join("tasks")).contains(&"42".to_string()));
        assert_eq!(read_tasks(&tmp.path().join("arbiter/3/tasks")), Vec::<String>::new());
    }

    #[test]
    fn test_move_thread_between_cpusets() {
        let tmp = fake_root("0-3\n");
        let mut ctl = CpusetController::new(tmp.path(), &[2, 3]).unwrap();

        ctl.move_thread_to_core(555, 3).unwrap();
        assert_eq!(read_tasks(&tmp.path().join("arbiter/3/tasks")), vec!["555"]);

        ctl.move_thread_to_unmanaged(555).unwrap();
        assert_eq!(
            read_tasks(&tmp.path().join("arbiter/Unmanaged/tasks")),
            vec!["555"]
        );
    }

    #[test]
    fn test_move_thread_to_unknown_core() {
        let tmp = fake_root("0-3\n");
        let mut ctl = CpusetController::new(tmp.path(), &[2, 3]).unwrap();
        assert!(ctl.move_thread_to_core(555, 0).is_err());
    }

    #[test]
    fn test_teardown_removes_hierarchy() {
        let tmp = fake_root("0-3\n");
        let mut ctl = CpusetController::new(tmp.path(), &[2, 3]).unwrap();
        ctl.move_thread_to_core(600, 2).unwrap();

        ctl.teardown().unwrap();

        assert!(!tmp.path().join("arbiter").exists());
        assert!(read_tasks(&tmp.path().join("tasks")).contains(&"600".to_string()));
    }

    #[test]
    fn test_unmounted_root_is_fatal() {
        let tmp = TempDir::new().unwrap();
        assert!(CpusetController::new(tmp.path(), &[1]).is_err());
    }

    #[test]
    fn test_unknown_exclusive_cpu_is_fatal() {
        let tmp = fake_root("0-3\n");
        assert!(CpusetController::new(tmp.path(), &[9]).is_err());
    }

    #[test]
    fn test_no_unmanaged_remainder_is_fatal() {
        let tmp = fake_root("0-3\n");
        assert!(CpusetController::new(tmp.path(), &[0, 1, 2, 3]).is_err());
    }
}
