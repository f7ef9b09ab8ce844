//! `rulegate` CLI entrypoint.
//!
//! Stages ruleset releases into the store, activates them through the Caddy
//! admin API, and applies retention. Progress goes to stderr; `status`
//! writes its report to stdout.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use rulegate::activation::{ActivationRequest, Activator, ConfigLoader};
use rulegate::caddy::CaddyAdminLoader;
use rulegate::catalog::JsonCatalog;
use rulegate::cli::{ActivateArgs, Cli, Command, FetchArgs, PruneArgs, UploadArgs};
use rulegate::config::RulegateConfig;
use rulegate::error::{CliError, Result};
use rulegate::lifecycle::prune_releases;
use rulegate::output::{pointer_line, prune_lines, staged_message, write_stderr_line};
use rulegate::package::download::HttpFetcher;
use rulegate::package::extraction::ArchiveExtractor;
use rulegate::package::sha256_digest::Sha256Digest;
use rulegate::pipeline::{ReleasePipeline, RemoteSource, StageSettings, StagedRelease, UploadSource};
use rulegate::release::{
    JobAction, JobRecord, JobStatus, NewRelease, ReleaseRecord, ReleaseStatus, unix_now,
};
use rulegate::store::{Pointer, Store};
use rulegate::version::derive_version_from_url;
use std::io::{self, Write};
use tempfile::NamedTempFile;

/// Applied config, kept as the default rollback target for the next activation.
const LIVE_CONFIG_FILE: &str = "live.caddyfile";

struct RunContext<'a> {
    config: &'a RulegateConfig,
    store: &'a Store,
    quiet: bool,
}

impl RunContext<'_> {
    fn progress(&self, stderr: &mut dyn Write, message: impl std::fmt::Display) {
        if !self.quiet {
            write_stderr_line(stderr, message);
        }
    }

    fn open_catalog(&self) -> Result<JsonCatalog> {
        Ok(JsonCatalog::open(self.config.catalog_path())?)
    }
}

fn main() {
    let cli = Cli::parse();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let run_result = run(&cli, &mut stdout, &mut stderr);
    let exit_code = exit_code_for_run_result(run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run(cli: &Cli, stdout: &mut dyn Write, stderr: &mut dyn Write) -> Result<()> {
    let config = RulegateConfig::load(cli.config.as_deref())?;
    let store = Store::new(config.base_dir());
    let context = RunContext {
        config: &config,
        store: &store,
        quiet: cli.quiet,
    };

    match &cli.command {
        Command::Fetch(args) => fetch(&context, args, stderr),
        Command::Upload(args) => upload(&context, args, stderr),
        Command::Activate(args) => {
            let loader = CaddyAdminLoader::new(&config.caddy);
            activate(&context, &loader, args, stderr)
        }
        Command::Prune(args) => prune(&context, args, stderr),
        Command::Status => status(&context, stdout),
    }
}

fn fetch(context: &RunContext<'_>, args: &FetchArgs, stderr: &mut dyn Write) -> Result<()> {
    let expected_sha256 = parse_checksum(args.sha256.as_deref())?;
    let mut catalog = context.open_catalog()?;
    let lookup_version = args
        .release_version
        .clone()
        .or_else(|| derive_version_from_url(&args.url));
    let existing = lookup_version
        .and_then(|version| catalog.find(&args.kind, &version))
        .cloned();

    context.progress(stderr, format!("Fetching {}...", args.url));
    let source = RemoteSource {
        url: args.url.clone(),
        kind: args.kind.clone(),
        version: args.release_version.clone(),
        expected_sha256,
        auth: args.auth(),
        proxy: args.proxy.clone(),
    };
    let staged = ReleasePipeline::new(
        context.store,
        &HttpFetcher,
        &ArchiveExtractor,
        StageSettings::from(context.config),
    )
    .stage_remote(&source, existing.as_ref())?;

    record_staged(context, &mut catalog, &staged, JobAction::Download, stderr)
}

fn upload(context: &RunContext<'_>, args: &UploadArgs, stderr: &mut dyn Write) -> Result<()> {
    let expected_sha256 = parse_checksum(args.sha256.as_deref())?;
    let mut catalog = context.open_catalog()?;
    let existing = catalog.find(&args.kind, args.release_version.trim()).cloned();

    context.progress(stderr, format!("Staging {}...", args.path));
    let source = UploadSource {
        path: args.path.clone(),
        kind: args.kind.clone(),
        version: args.release_version.clone(),
        expected_sha256,
    };
    let staged = ReleasePipeline::new(
        context.store,
        &HttpFetcher,
        &ArchiveExtractor,
        StageSettings::from(context.config),
    )
    .stage_upload(&source, existing.as_ref())?;

    record_staged(context, &mut catalog, &staged, JobAction::Upload, stderr)
}

fn parse_checksum(value: Option<&str>) -> Result<Option<Sha256Digest>> {
    value
        .map(Sha256Digest::parse)
        .transpose()
        .map_err(|source| CliError::InvalidChecksum { source })
}

/// Record a staged release and its job, then apply retention for its kind.
fn record_staged(
    context: &RunContext<'_>,
    catalog: &mut JsonCatalog,
    staged: &StagedRelease,
    action: JobAction,
    stderr: &mut dyn Write,
) -> Result<()> {
    let reused_id = if staged.reused {
        catalog
            .find(&staged.kind, &staged.version)
            .map(|record| record.id)
    } else {
        None
    };
    let (release_id, message) = match reused_id {
        Some(id) => (id, "reused existing release".to_owned()),
        None => {
            let record = catalog.upsert(NewRelease {
                kind: staged.kind.clone(),
                version: staged.version.clone(),
                artifact_type: staged.artifact_type,
                checksum: staged.checksum.clone(),
                size_bytes: staged.size_bytes,
                storage_path: staged.storage_path.clone(),
                status: ReleaseStatus::Verified,
            })?;
            (record.id, String::new())
        }
    };
    catalog.record_job(JobRecord {
        release_id,
        action,
        status: JobStatus::Success,
        message,
        finished_at_unix: unix_now(),
    })?;
    context.progress(stderr, staged_message(staged));

    let report = prune_releases(
        context.store,
        catalog,
        &staged.kind,
        context.config.retention_count(),
    )?;
    if !report.deleted.is_empty() {
        for line in prune_lines(&staged.kind, &report) {
            context.progress(stderr, line);
        }
    }
    Ok(())
}

fn activate(
    context: &RunContext<'_>,
    loader: &dyn ConfigLoader,
    args: &ActivateArgs,
    stderr: &mut dyn Write,
) -> Result<()> {
    let mut catalog = context.open_catalog()?;
    let record = catalog
        .find(&args.kind, &args.version)
        .cloned()
        .ok_or_else(|| CliError::UnknownRelease {
            kind: args.kind.clone(),
            version: args.version.clone(),
        })?;
    let candidate = read_config_file(&args.config_file)?;
    let live_path = context.store.base_dir().join(LIVE_CONFIG_FILE);
    let previous = match &args.previous_config_file {
        Some(path) => Some(read_config_file(path)?),
        None if live_path.is_file() => Some(read_config_file(&live_path)?),
        None => None,
    };

    context.progress(
        stderr,
        format!("Activating {} release {}...", record.kind, record.version),
    );
    activate_release(
        context,
        &mut catalog,
        loader,
        &record,
        &candidate,
        previous.as_deref(),
    )?;
    save_live_config(&live_path, &candidate)?;
    context.progress(
        stderr,
        format!("Activated {} release {}", record.kind, record.version),
    );
    Ok(())
}

/// Activate `record` and reflect the outcome in the catalog.
fn activate_release(
    context: &RunContext<'_>,
    catalog: &mut JsonCatalog,
    loader: &dyn ConfigLoader,
    record: &ReleaseRecord,
    candidate_config: &str,
    previous_config: Option<&str>,
) -> Result<()> {
    let request = ActivationRequest {
        version: &record.version,
        candidate_config,
        previous_config,
    };
    match Activator::new(context.store, loader).activate(&request) {
        Ok(_) => {
            catalog.mark_active(record.id)?;
            catalog.record_job(job(record, JobAction::Activate, JobStatus::Success, String::new()))?;
            Ok(())
        }
        Err(err) => {
            catalog.record_job(job(record, JobAction::Activate, JobStatus::Failed, err.to_string()))?;
            if err.loader_error().is_some() {
                catalog.mark_failed(record.id)?;
                let rollback_status = if err.may_be_inconsistent() {
                    JobStatus::Failed
                } else {
                    JobStatus::Success
                };
                catalog.record_job(job(record, JobAction::Rollback, rollback_status, String::new()))?;
            }
            Err(err.into())
        }
    }
}

fn job(record: &ReleaseRecord, action: JobAction, status: JobStatus, message: String) -> JobRecord {
    JobRecord {
        release_id: record.id,
        action,
        status,
        message,
        finished_at_unix: unix_now(),
    }
}

fn read_config_file(path: &Utf8Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| CliError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

fn save_live_config(path: &Utf8Path, config: &str) -> Result<()> {
    let save_error = |source| CliError::SaveLiveConfig {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut temp = NamedTempFile::new_in(parent).map_err(save_error)?;
    temp.write_all(config.as_bytes()).map_err(save_error)?;
    temp.as_file().sync_all().map_err(save_error)?;
    temp.persist(path).map_err(|err| save_error(err.error))?;
    Ok(())
}

fn prune(context: &RunContext<'_>, args: &PruneArgs, stderr: &mut dyn Write) -> Result<()> {
    let mut catalog = context.open_catalog()?;
    let keep = args.keep.unwrap_or_else(|| context.config.retention_count());
    let report = prune_releases(context.store, &mut catalog, &args.kind, keep)?;
    for line in prune_lines(&args.kind, &report) {
        context.progress(stderr, line);
    }
    Ok(())
}

fn status(context: &RunContext<'_>, stdout: &mut dyn Write) -> Result<()> {
    for pointer in Pointer::ALL {
        let target: Option<Utf8PathBuf> = context.store.pointer_target(pointer)?;
        writeln!(stdout, "{}", pointer_line(pointer, target.as_deref())).map_err(CliError::Output)?;
    }
    Ok(())
}

fn exit_code_for_run_result(result: Result<()>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            write_stderr_line(stderr, format!("error: {err}"));
            if let Some(hint) = err.remediation() {
                write_stderr_line(stderr, format!("hint: {hint}"));
            }
            err.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulegate::release::ArtifactType;
    use rulegate::test_utils::{RecordingLoader, rejected};

    struct Sandbox {
        _temp: tempfile::TempDir,
        config: RulegateConfig,
        store: Store,
    }

    impl Sandbox {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("temp dir");
            let base = Utf8PathBuf::try_from(temp.path().join("waf")).expect("UTF-8 path");
            let config = RulegateConfig {
                base_dir: Some(base.clone()),
                ..RulegateConfig::default()
            };
            let store = Store::new(base);
            store.ensure_dirs().expect("store dirs");
            Self {
                _temp: temp,
                config,
                store,
            }
        }

        fn context(&self) -> RunContext<'_> {
            RunContext {
                config: &self.config,
                store: &self.store,
                quiet: true,
            }
        }

        fn staged_release(&self, catalog: &mut JsonCatalog, version: &str) -> ReleaseRecord {
            let storage_path = self.store.release_dir(version);
            std::fs::create_dir_all(&storage_path).expect("release dir");
            catalog
                .upsert(NewRelease {
                    kind: "crs".to_owned(),
                    version: version.to_owned(),
                    artifact_type: ArtifactType::Zip,
                    checksum: "ab".repeat(32),
                    size_bytes: 1,
                    storage_path,
                    status: ReleaseStatus::Verified,
                })
                .expect("record")
        }
    }

    #[test]
    fn exit_code_for_run_result_returns_zero_on_success() {
        let mut stderr = Vec::new();
        assert_eq!(exit_code_for_run_result(Ok(()), &mut stderr), 0);
        assert!(stderr.is_empty());
    }

    #[test]
    fn exit_code_for_run_result_prints_error_and_hint() {
        let err = CliError::UnknownRelease {
            kind: "crs".to_owned(),
            version: "v9".to_owned(),
        };
        let mut stderr = Vec::new();

        let exit_code = exit_code_for_run_result(Err(err), &mut stderr);

        assert_eq!(exit_code, 2);
        let text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(text.contains("error: no crs release v9 in the catalog"));
        assert!(text.contains("hint: stage the release"));
    }

    #[test]
    fn successful_activation_marks_the_release_active() {
        let sandbox = Sandbox::new();
        let context = sandbox.context();
        let mut catalog = context.open_catalog().expect("catalog");
        let record = sandbox.staged_release(&mut catalog, "v1");
        let loader = RecordingLoader::new();

        activate_release(&context, &mut catalog, &loader, &record, "new", Some("old"))
            .expect("activate");

        assert_eq!(catalog.active("crs").map(|r| r.id), Some(record.id));
        assert_eq!(catalog.jobs().len(), 1);
        assert_eq!(catalog.jobs()[0].status, JobStatus::Success);
    }

    #[test]
    fn rejected_activation_marks_the_release_failed() {
        let sandbox = Sandbox::new();
        let context = sandbox.context();
        let mut catalog = context.open_catalog().expect("catalog");
        let record = sandbox.staged_release(&mut catalog, "v1");
        let loader = RecordingLoader::new().failing_adapt(rejected("/adapt"));

        let err = activate_release(&context, &mut catalog, &loader, &record, "new", Some("old"))
            .expect_err("rejected");

        assert_eq!(err.exit_code(), 5);
        assert_eq!(
            catalog.find("crs", "v1").map(|r| r.status),
            Some(ReleaseStatus::Failed)
        );
        let actions: Vec<_> = catalog.jobs().iter().map(|job| (job.action, job.status)).collect();
        assert_eq!(
            actions,
            vec![
                (JobAction::Activate, JobStatus::Failed),
                (JobAction::Rollback, JobStatus::Success),
            ]
        );
    }

    #[test]
    fn activate_saves_the_applied_config_as_the_next_rollback_target() {
        let sandbox = Sandbox::new();
        let context = sandbox.context();
        let mut catalog = context.open_catalog().expect("catalog");
        sandbox.staged_release(&mut catalog, "v1");
        sandbox.staged_release(&mut catalog, "v2");
        let config_dir = sandbox.store.base_dir().join("configs");
        std::fs::create_dir_all(&config_dir).expect("config dir");
        for version in ["v1", "v2"] {
            std::fs::write(config_dir.join(version), format!("config {version}")).expect("config");
        }
        let loader = RecordingLoader::new().failing_adapt(rejected("/adapt"));
        let args = |version: &str| ActivateArgs {
            version: version.to_owned(),
            config_file: config_dir.join(version),
            previous_config_file: None,
            kind: "crs".to_owned(),
        };

        activate(&context, &RecordingLoader::new(), &args("v1"), &mut io::sink()).expect("v1");
        activate(&context, &loader, &args("v2"), &mut io::sink()).expect_err("v2 rejected");

        assert_eq!(loader.load_count("config v1"), 1);
    }

    #[test]
    fn status_reports_unset_pointers() {
        let sandbox = Sandbox::new();
        let mut stdout = Vec::new();

        status(&sandbox.context(), &mut stdout).expect("status");

        let text = String::from_utf8(stdout).expect("stdout was not UTF-8");
        assert_eq!(text, "current: (unset)\nlast_good: (unset)\n");
    }
}
