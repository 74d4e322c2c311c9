//! In-memory control plane and sandbox for orchestrator tests.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use fls_common::{Arch, Submission};

use crate::api::ControlPlane;
use crate::error::{Result, WorkerError};
use crate::joblog::JobLog;
use crate::sandbox::{Sandbox, ARTIFACT_NAME};

pub fn submission(id: u64, arch: Arch) -> Submission {
    Submission {
        id,
        user_id: format!("student-{}", id),
        tarball: Some(format!("{}.tar.gz", id)),
        arch,
        created_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
    }
}

/// Gzip-compressed tarball holding `files`.
pub fn gzip_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *contents).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Plain tarball with a single entry escaping the extraction root.
pub fn escaping_tar() -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    let name = b"../escape";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut out = Vec::new();
    out.write_all(header.as_bytes()).unwrap();
    let mut data = vec![0u8; 512];
    data[..4].copy_from_slice(b"pwnd");
    out.write_all(&data).unwrap();
    out.write_all(&[0u8; 1024]).unwrap();
    out
}

/// [`escaping_tar`] with its member renamed, through a GNU long-name
/// record, to `../` followed by `len` characters.
pub fn long_escaping_tar(len: usize) -> Vec<u8> {
    let name = format!("../{}", "a".repeat(len));
    let mut header = tar::Header::new_gnu();
    let marker = b"././@LongLink";
    header.as_old_mut().name[..marker.len()].copy_from_slice(marker);
    header.set_size(name.len() as u64 + 1);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::GNULongName);
    header.set_cksum();

    let mut out = Vec::new();
    out.write_all(header.as_bytes()).unwrap();
    let mut data = name.into_bytes();
    data.push(0);
    data.resize(data.len().div_ceil(512) * 512, 0);
    out.write_all(&data).unwrap();
    out.write_all(&escaping_tar()).unwrap();
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List(Arch),
    Claim(u64),
    Cancel(u64),
    Download(u64),
    Submit {
        id: u64,
        passed: bool,
        log_path: PathBuf,
        log: String,
    },
    Heartbeat,
}

#[derive(Debug, Clone, Copy)]
pub enum ClaimBehavior {
    Ok,
    Conflict,
    Auth,
}

pub struct FakeControlPlane {
    submissions: Vec<Submission>,
    tarball: Vec<u8>,
    claim: ClaimBehavior,
    fail_list: bool,
    fail_submit: bool,
    fail_heartbeat: bool,
    hang_heartbeat: bool,
    slow_first_heartbeat: Option<Duration>,
    calls: Mutex<Vec<Call>>,
}

impl FakeControlPlane {
    pub fn new(submissions: Vec<Submission>) -> Self {
        Self {
            submissions,
            tarball: gzip_tar(&[("Makefile", &b"all:\n"[..]), ("kernel/main.c", &b"int main(void) { return 0; }\n"[..])]),
            claim: ClaimBehavior::Ok,
            fail_list: false,
            fail_submit: false,
            fail_heartbeat: false,
            hang_heartbeat: false,
            slow_first_heartbeat: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tarball(mut self, tarball: Vec<u8>) -> Self {
        self.tarball = tarball;
        self
    }

    pub fn with_claim(mut self, claim: ClaimBehavior) -> Self {
        self.claim = claim;
        self
    }

    pub fn failing_list(mut self) -> Self {
        self.fail_list = true;
        self
    }

    pub fn failing_submit(mut self) -> Self {
        self.fail_submit = true;
        self
    }

    pub fn failing_heartbeat(mut self) -> Self {
        self.fail_heartbeat = true;
        self
    }

    pub fn hanging_heartbeat(mut self) -> Self {
        self.hang_heartbeat = true;
        self
    }

    /// The first heartbeat takes `delay` to answer.
    pub fn slow_first_heartbeat(mut self, delay: Duration) -> Self {
        self.slow_first_heartbeat = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn submits(&self) -> Vec<(u64, bool, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit { id, passed, log, .. } => Some((id, passed, log)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn unavailable() -> WorkerError {
        WorkerError::BadResponse {
            status: 503,
            body: "unavailable".to_string(),
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn list_submissions(&self, arch: Arch) -> Result<Vec<Submission>> {
        self.record(Call::List(arch));
        if self.fail_list {
            return Err(Self::unavailable());
        }
        Ok(self.submissions.iter().filter(|s| s.arch == arch).cloned().collect())
    }

    async fn claim(&self, submission: &Submission) -> Result<()> {
        self.record(Call::Claim(submission.id));
        match self.claim {
            ClaimBehavior::Ok => Ok(()),
            ClaimBehavior::Conflict => Err(WorkerError::AlreadyClaimed),
            ClaimBehavior::Auth => Err(WorkerError::Auth),
        }
    }

    async fn cancel(&self, submission: &Submission) -> Result<()> {
        self.record(Call::Cancel(submission.id));
        Ok(())
    }

    async fn download_tarball(&self, submission: &Submission, dest: &Path) -> Result<()> {
        self.record(Call::Download(submission.id));
        std::fs::write(dest, &self.tarball).map_err(|e| WorkerError::environment("write tarball", e))
    }

    async fn submit_result(&self, submission: &Submission, passed: bool, log_path: &Path) -> Result<()> {
        let log = std::fs::read(log_path)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        self.record(Call::Submit {
            id: submission.id,
            passed,
            log_path: log_path.to_path_buf(),
            log,
        });
        if self.fail_submit {
            return Err(Self::unavailable());
        }
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.record(Call::Heartbeat);
        if let Some(delay) = self.slow_first_heartbeat {
            if self.count(|c| matches!(c, Call::Heartbeat)) == 1 {
                tokio::time::sleep(delay).await;
            }
        }
        if self.hang_heartbeat {
            std::future::pending::<()>().await;
        }
        if self.fail_heartbeat {
            return Err(Self::unavailable());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BuildBehavior {
    Ok,
    ExitCode(i64),
    EngineDown,
    Panic,
}

#[derive(Debug, Clone, Copy)]
pub enum GradeBehavior {
    Ok,
    ExitCode(i64),
}

pub struct FakeSandbox {
    build: BuildBehavior,
    grade: GradeBehavior,
    fail_prepare: bool,
    builds: AtomicUsize,
    grades: AtomicUsize,
    staged: Mutex<Vec<PathBuf>>,
}

impl FakeSandbox {
    pub fn new(build: BuildBehavior, grade: GradeBehavior) -> Self {
        Self {
            build,
            grade,
            fail_prepare: false,
            builds: AtomicUsize::new(0),
            grades: AtomicUsize::new(0),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(BuildBehavior::Ok, GradeBehavior::Ok)
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn grades(&self) -> usize {
        self.grades.load(Ordering::SeqCst)
    }

    /// Source files visible to the most recent build.
    pub fn staged(&self) -> Vec<PathBuf> {
        self.staged.lock().unwrap().clone()
    }

    fn engine_down() -> WorkerError {
        WorkerError::engine(
            "create exec",
            bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "Cannot connect to the Docker daemon".to_string(),
            },
        )
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out);
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn prepare(&self) -> Result<()> {
        if self.fail_prepare {
            return Err(Self::engine_down());
        }
        Ok(())
    }

    async fn build(&self, src_dir: &Path, out_dir: &Path, log: &mut JobLog) -> Result<PathBuf> {
        self.builds.fetch_add(1, Ordering::SeqCst);

        let mut staged = Vec::new();
        walk(src_dir, src_dir, &mut staged);
        staged.sort();
        *self.staged.lock().unwrap() = staged;

        log.append(b"make: building stages\n").await?;
        match self.build {
            BuildBehavior::Ok => {
                let artifact = out_dir.join(ARTIFACT_NAME);
                std::fs::write(&artifact, b"\x55\xaa")
                    .map_err(|e| WorkerError::environment("write artifact", e))?;
                Ok(artifact)
            }
            BuildBehavior::ExitCode(code) => Err(WorkerError::BuildFailed(code)),
            BuildBehavior::EngineDown => Err(Self::engine_down()),
            BuildBehavior::Panic => panic!("builder exploded"),
        }
    }

    async fn grade(&self, _artifact: &Path, log: &mut JobLog) -> Result<()> {
        self.grades.fetch_add(1, Ordering::SeqCst);
        log.append(b"grade: 3/3 tests passed\n").await?;
        match self.grade {
            GradeBehavior::Ok => Ok(()),
            GradeBehavior::ExitCode(code) => Err(WorkerError::GradeFailed(code)),
        }
    }
}
