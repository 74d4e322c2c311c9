// CLI commands for operating an FLS grading worker
use anyhow::{bail, Context, Result};
use fls_common::{ApiConfig, Arch, SandboxConfig, Submission};
use fls_worker::extract::{extract_archive, ExtractSummary};
use fls_worker::joblog::JobLog;
use fls_worker::workspace::JobWorkspace;
use fls_worker::{ApiClient, ControlPlane, DockerSandbox, FaultKind, Sandbox, WorkerError};
use std::fs;
use std::path::{Path, PathBuf};

fn host_arch(arch: Option<Arch>) -> Result<Arch> {
    match arch.or_else(Arch::detect) {
        Some(arch) => Ok(arch),
        None => bail!("cannot detect host architecture, pass --arch"),
    }
}

fn submission_row(s: &Submission) -> String {
    format!(
        "{:>8}  {:<24}  {:<8}  {}  {}",
        s.id,
        s.user_id,
        s.arch.as_str(),
        s.created_at.format("%Y-%m-%d %H:%M:%S"),
        s.tarball.as_deref().unwrap_or("-"),
    )
}

/// List pending submissions for one architecture
pub async fn list_submissions(arch: Option<Arch>, json: bool) -> Result<()> {
    let arch = host_arch(arch)?;
    let config = ApiConfig::from_env().context("Failed to load API configuration")?;
    let client = ApiClient::new(&config)?;

    let submissions = client
        .list_submissions(arch)
        .await
        .with_context(|| format!("Failed to list submissions from {}", config.base_url))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&submissions)?);
        return Ok(());
    }

    if submissions.is_empty() {
        println!("No pending submissions for {}", arch);
        return Ok(());
    }

    println!("📋 Pending submissions ({}):", arch);
    println!();
    println!("{:>8}  {:<24}  {:<8}  {:<19}  TARBALL", "ID", "USER", "ARCH", "CREATED");
    for submission in &submissions {
        println!("{}", submission_row(submission));
    }
    println!();
    println!("{} submission(s)", submissions.len());
    Ok(())
}

#[derive(Debug)]
pub struct TarballReport {
    pub summary: ExtractSummary,
    pub files: Vec<PathBuf>,
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            out.push(path.strip_prefix(root)?.to_path_buf());
        }
    }
    Ok(())
}

/// Extract into a throwaway directory and report what would be staged
pub fn inspect_tarball(path: &Path) -> Result<TarballReport> {
    let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
    let summary = extract_archive(path, scratch.path())
        .map_err(|e| anyhow::anyhow!("archive rejected: {}", e))?;

    let mut files = Vec::new();
    collect_files(scratch.path(), scratch.path(), &mut files)?;
    files.sort();

    Ok(TarballReport { summary, files })
}

pub fn check_tarball(path: &Path) -> Result<()> {
    println!("🔍 Checking {}", path.display());

    let report = match inspect_tarball(path) {
        Ok(report) => report,
        Err(e) => {
            println!("✗ {}", e);
            bail!("tarball would be reported as a failing submission");
        }
    };

    for file in &report.files {
        println!("  {}", file.display());
    }
    println!();
    println!(
        "✓ Accepted: {} files, {} directories, {} bytes",
        report.summary.files, report.summary.directories, report.summary.bytes
    );
    Ok(())
}

/// Run the full build and grade flow against a local tarball
pub async fn grade_local(path: &Path, keep: bool, log_out: Option<&Path>) -> Result<()> {
    let config = SandboxConfig::from_env().context("Failed to load sandbox configuration")?;
    println!("🚀 Grading {} locally", path.display());

    let workspace = JobWorkspace::create(&config.jobs_root()).await?;
    let tarball = workspace.tarball_path();
    fs::copy(path, &tarball).with_context(|| format!("Failed to copy {}", path.display()))?;

    let mut log = JobLog::open(&workspace.log_path(), config.max_log_bytes).await?;
    let verdict = run_local(&config, &workspace, &mut log).await;

    let note = match &verdict {
        Ok(()) => "result: passed".to_string(),
        Err(e) => format!("result: failed ({})", e),
    };
    log.note(&note).await?;
    log.flush().await?;

    if let Some(dest) = log_out {
        fs::copy(workspace.log_path(), dest)
            .with_context(|| format!("Failed to copy job log to {}", dest.display()))?;
        println!("  Log copied to {}", dest.display());
    }

    let log_path = workspace.log_path();
    if keep {
        let root = workspace.into_kept();
        println!("  Workspace kept at {}", root.display());
        println!("  Log: {}", log_path.display());
    } else {
        workspace.remove().await;
    }

    match verdict {
        Ok(()) => {
            println!("✓ PASSED");
            Ok(())
        }
        Err(e) if e.kind() == FaultKind::Student => {
            println!("✗ FAILED: {}", e);
            bail!("submission failed");
        }
        Err(e) => Err(e).context("sandbox could not grade the submission"),
    }
}

async fn run_local(
    config: &SandboxConfig,
    workspace: &JobWorkspace,
    log: &mut JobLog,
) -> std::result::Result<(), WorkerError> {
    let summary =
        fls_worker::extract::stage_archive(&workspace.tarball_path(), &workspace.src_dir()).await?;
    println!("  Staged {} files", summary.files);

    let sandbox = DockerSandbox::connect(config)?;
    sandbox.prepare().await?;

    println!("  Building...");
    let artifact = sandbox.build(&workspace.src_dir(), &workspace.out_dir(), log).await?;
    println!("  Grading...");
    sandbox.grade(&artifact, log).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn write_tar(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn test_inspect_accepts_clean_tarball() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sub.tar");
        write_tar(&path, &[("Makefile", &b"all:\n"[..]), ("boot/stage1.S", &b"nop\n"[..])]);

        let report = inspect_tarball(&path).unwrap();

        assert_eq!(report.summary.files, 2);
        assert_eq!(
            report.files,
            vec![PathBuf::from("Makefile"), PathBuf::from("boot/stage1.S")]
        );
    }

    #[test]
    fn test_inspect_rejects_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sub.tar");
        {
            let file = fs::File::create(&path).unwrap();
            let mut builder = tar::Builder::new(file);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name("/etc").unwrap();
            builder.append_data(&mut header, "etc", std::io::empty()).unwrap();
            builder.finish().unwrap();
        }

        let err = inspect_tarball(&path).unwrap_err();
        assert!(err.to_string().contains("archive rejected"));
    }

    #[test]
    fn test_submission_row() {
        let submission = Submission {
            id: 42,
            user_id: "student-7".to_string(),
            tarball: None,
            arch: Arch::Aarch64,
            created_at: Utc.with_ymd_and_hms(2025, 1, 12, 10, 0, 0).unwrap(),
        };

        let row = submission_row(&submission);
        assert!(row.trim_start().starts_with("42"));
        assert!(row.contains("aarch64"));
        assert!(row.contains("2025-01-12 10:00:00"));
        assert!(row.ends_with('-'));
    }
}
