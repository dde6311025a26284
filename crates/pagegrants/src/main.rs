use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use pagegrants_core::apply::{ApplyOptions, ApplyReport, UpdateMode, apply_directives};
use pagegrants_core::client::{DekiClient, SecurityApi};
use pagegrants_core::config::{
    DEFAULT_SETTINGS_FILENAME, ResolvedSettings, SettingsOverrides, load_settings,
    resolve_settings,
};
use pagegrants_core::logging::init_logging;
use pagegrants_core::manifest::{Manifest, SkippedPage, load_manifest};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(
    name = "pagegrants",
    version,
    about = "Bulk-apply page restrictions and permission grants to a MindTouch wiki",
    after_help = "Example: pagegrants -s site.mindtouch.us -u admin -p password config.xml"
)]
struct Cli {
    #[arg(short, long, value_name = "SITE", help = "Site address")]
    site: Option<String>,
    #[arg(short, long, value_name = "USER", help = "Username")]
    username: Option<String>,
    #[arg(short, long, value_name = "PASSWORD", help = "Password")]
    password: Option<String>,
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
    #[arg(
        short = 'd',
        long = "dry-run",
        visible_alias = "dryrun",
        help = "Only perform a dry run, do not change actual data"
    )]
    dry_run: bool,
    #[arg(
        long,
        value_name = "MODE",
        default_value = "merge",
        value_parser = UpdateMode::parse,
        help = "merge: read, merge and POST page security; replace: PUT a new security document"
    )]
    mode: UpdateMode,
    #[arg(long, help = "Skip the initial site/status request")]
    no_status_check: bool,
    #[arg(long, value_name = "PATH", help = "TOML settings file [default: pagegrants.toml]")]
    settings: Option<PathBuf>,
    #[arg(long, help = "Print the apply report as JSON")]
    json: bool,
    #[arg(value_name = "CONFIG", help = "XML file listing page directives")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose)?;
    run(&cli)
}

fn run(cli: &Cli) -> Result<()> {
    let settings = resolve_runtime_settings(cli)?;
    let config_path = std::path::absolute(&cli.config).unwrap_or_else(|_| cli.config.clone());

    let manifest = load_manifest(&config_path)?;
    for skipped in &manifest.skipped {
        tracing::warn!(
            position = skipped.position,
            "{}; skipping page:\n\n{}",
            skipped.reason,
            skipped.snippet
        );
    }
    if cli.verbose && !cli.json {
        for directive in &manifest.directives {
            println!("{directive}\n");
        }
    }
    let mut client = DekiClient::new(settings.client.clone())?;
    let report = run_with_api(&mut client, cli, &settings.site, &manifest, &config_path)?;

    if cli.json {
        println!("{}", render_json(&report, &manifest)?);
    } else {
        print_report(cli, &settings, &config_path, &manifest, &report);
    }
    Ok(())
}

fn run_with_api<A: SecurityApi>(
    api: &mut A,
    cli: &Cli,
    site: &str,
    manifest: &Manifest,
    config_path: &Path,
) -> Result<ApplyReport> {
    if manifest.directives.is_empty() {
        bail!(
            "no page configurations were parsed from the XML config file: {}",
            normalize_path(config_path)
        );
    }

    if cli.no_status_check {
        tracing::info!("status check skipped; connectivity inferred from page requests");
    } else {
        api.check_status()
            .with_context(|| format!("cannot connect to {site} with the provided credentials"))?;
    }

    Ok(apply_directives(
        api,
        &manifest.directives,
        &ApplyOptions {
            mode: cli.mode,
            dry_run: cli.dry_run,
        },
    ))
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    #[serde(flatten)]
    report: &'a ApplyReport,
    skipped: &'a [SkippedPage],
}

fn render_json(report: &ApplyReport, manifest: &Manifest) -> Result<String> {
    let output = JsonOutput {
        report,
        skipped: &manifest.skipped,
    };
    Ok(serde_json::to_string_pretty(&output)?)
}

fn resolve_runtime_settings(cli: &Cli) -> Result<ResolvedSettings> {
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILENAME));
    if cli.settings.is_some() && !settings_path.exists() {
        bail!("settings file not found: {}", normalize_path(&settings_path));
    }
    let file = load_settings(&settings_path)?;
    resolve_settings(
        &file,
        &SettingsOverrides {
            site: cli.site.clone(),
            username: cli.username.clone(),
            password: cli.password.clone(),
        },
    )
}

fn print_report(
    cli: &Cli,
    settings: &ResolvedSettings,
    config_path: &Path,
    manifest: &Manifest,
    report: &ApplyReport,
) {
    println!("pagegrants");
    println!("site: {}", settings.site);
    println!("config: {}", normalize_path(config_path));
    println!("mode: {}", report.mode.as_str());
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("pages.parsed: {}", manifest.directives.len());
    println!("pages.skipped: {}", manifest.skipped.len());
    for result in &report.results {
        println!(
            "page: {} -> {} (cascade={})",
            result.path,
            result.action.as_str(),
            result.cascade
        );
        if let Some(detail) = &result.detail {
            println!("  detail: {detail}");
        }
        if cli.verbose
            && report.dry_run
            && let Some(document) = &result.document
        {
            println!("  document: {document}");
        }
    }
    println!("summary.updated: {}", report.updated);
    println!("summary.planned: {}", report.planned);
    println!("summary.failed: {}", report.failed);
    println!("requests: {}", report.request_count);
    if cli.verbose {
        println!("\n[diagnostics]\n{}", settings.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use clap::{CommandFactory, Parser};
    use pagegrants_core::apply::{PageAction, UpdateMode};
    use pagegrants_core::client::SecurityApi;
    use pagegrants_core::manifest::{CascadeMode, parse_manifest};
    use tempfile::tempdir;

    use super::{Cli, render_json, resolve_runtime_settings, run_with_api};

    #[derive(Default)]
    struct MockApi {
        status_fails: bool,
        status_checks: usize,
        page_requests: usize,
        request_count: usize,
    }

    impl SecurityApi for MockApi {
        fn check_status(&mut self) -> anyhow::Result<()> {
            self.request_count += 1;
            self.status_checks += 1;
            if self.status_fails {
                anyhow::bail!("Deki API GET /@api/deki/site/status failed with HTTP 401");
            }
            Ok(())
        }

        fn get_page_security(&mut self, _page_path: &str) -> anyhow::Result<String> {
            self.request_count += 1;
            self.page_requests += 1;
            Ok("<security><permissions.page><restriction>Public</restriction></permissions.page></security>".to_string())
        }

        fn post_page_security(
            &mut self,
            _page_path: &str,
            _cascade: CascadeMode,
            _document: &str,
        ) -> anyhow::Result<()> {
            self.request_count += 1;
            self.page_requests += 1;
            Ok(())
        }

        fn put_page_security(
            &mut self,
            _page_path: &str,
            _cascade: CascadeMode,
            _document: &str,
        ) -> anyhow::Result<()> {
            self.request_count += 1;
            self.page_requests += 1;
            Ok(())
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn cli(extra: &[&str]) -> Cli {
        let mut args = vec!["pagegrants", "-s", "wiki", "-u", "admin", "-p", "pw"];
        args.extend_from_slice(extra);
        args.push("grants.xml");
        Cli::try_parse_from(args).expect("parse")
    }

    const ONE_PAGE: &str = "<pages><page><path>Docs</path></page></pages>";

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn short_flags_match_original_usage() {
        let cli = Cli::try_parse_from([
            "pagegrants",
            "-s",
            "site.mindtouch.us",
            "-u",
            "admin",
            "-p",
            "password",
            "-v",
            "-d",
            "config.xml",
        ])
        .expect("parse");
        assert_eq!(cli.site.as_deref(), Some("site.mindtouch.us"));
        assert_eq!(cli.username.as_deref(), Some("admin"));
        assert_eq!(cli.password.as_deref(), Some("password"));
        assert!(cli.verbose);
        assert!(cli.dry_run);
        assert_eq!(cli.mode, UpdateMode::Merge);
        assert_eq!(cli.config.to_string_lossy(), "config.xml");
    }

    #[test]
    fn dryrun_alias_and_mode_are_accepted() {
        let cli = Cli::try_parse_from(["pagegrants", "--dryrun", "--mode", "replace", "grants.xml"])
            .expect("parse");
        assert!(cli.dry_run);
        assert_eq!(cli.mode, UpdateMode::Replace);
    }

    #[test]
    fn config_path_is_required() {
        assert!(Cli::try_parse_from(["pagegrants", "-s", "wiki"]).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["pagegrants", "--mode", "patch", "grants.xml"]).is_err());
    }

    #[test]
    fn failed_status_check_aborts_before_any_page_request() {
        let manifest = parse_manifest(ONE_PAGE).expect("parse");
        let mut api = MockApi {
            status_fails: true,
            ..MockApi::default()
        };

        let error = run_with_api(
            &mut api,
            &cli(&[]),
            "http://wiki",
            &manifest,
            Path::new("grants.xml"),
        )
        .expect_err("must fail");

        assert!(
            error
                .to_string()
                .contains("cannot connect to http://wiki with the provided credentials")
        );
        assert_eq!(api.status_checks, 1);
        assert_eq!(api.page_requests, 0);
    }

    #[test]
    fn manifest_with_only_skipped_pages_is_fatal() {
        let manifest =
            parse_manifest("<pages><page><restriction>Private</restriction></page></pages>")
                .expect("parse");
        assert_eq!(manifest.skipped.len(), 1);
        let mut api = MockApi::default();

        let error = run_with_api(
            &mut api,
            &cli(&[]),
            "http://wiki",
            &manifest,
            Path::new("grants.xml"),
        )
        .expect_err("must fail");

        assert!(
            error
                .to_string()
                .contains("no page configurations were parsed from the XML config file")
        );
        assert_eq!(api.request_count, 0);
    }

    #[test]
    fn status_check_runs_before_pages_are_applied() {
        let manifest = parse_manifest(ONE_PAGE).expect("parse");
        let mut api = MockApi::default();

        let report = run_with_api(
            &mut api,
            &cli(&[]),
            "http://wiki",
            &manifest,
            Path::new("grants.xml"),
        )
        .expect("run");

        assert_eq!(api.status_checks, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.request_count, 3);
    }

    #[test]
    fn no_status_check_goes_straight_to_pages() {
        let manifest = parse_manifest(ONE_PAGE).expect("parse");
        let mut api = MockApi {
            status_fails: true,
            ..MockApi::default()
        };

        let report = run_with_api(
            &mut api,
            &cli(&["--no-status-check", "--dry-run"]),
            "http://wiki",
            &manifest,
            Path::new("grants.xml"),
        )
        .expect("run");

        assert_eq!(api.status_checks, 0);
        assert_eq!(report.results[0].action, PageAction::Planned);
        assert_eq!(api.page_requests, 1);
    }

    #[test]
    fn explicit_missing_settings_file_is_fatal() {
        let temp = tempdir().expect("tempdir");
        let missing = temp.path().join("absent.toml");
        let cli = cli(&["--settings", missing.to_str().expect("utf-8 path")]);

        let error = resolve_runtime_settings(&cli).expect_err("must fail");
        assert!(error.to_string().starts_with("settings file not found:"));
    }

    #[test]
    fn explicit_settings_file_is_loaded() {
        let temp = tempdir().expect("tempdir");
        let settings_path = temp.path().join("site.toml");
        fs::write(&settings_path, "[site]\nretry_delay_ms = 42\n").expect("write settings");
        let cli = cli(&["--settings", settings_path.to_str().expect("utf-8 path")]);

        let settings = resolve_runtime_settings(&cli).expect("resolve");
        assert_eq!(settings.site, "http://wiki");
        assert_eq!(settings.client.username, "admin");
    }

    #[test]
    fn json_output_includes_skipped_pages() {
        let manifest = parse_manifest(
            "<pages><page><path>Docs</path></page><page cascade=\"often\"><path>Bad</path></page></pages>",
        )
        .expect("parse");
        let mut api = MockApi::default();
        let report = run_with_api(
            &mut api,
            &cli(&[]),
            "http://wiki",
            &manifest,
            Path::new("grants.xml"),
        )
        .expect("run");

        let rendered = render_json(&report, &manifest).expect("render");
        let json: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(json["updated"], 1);
        assert_eq!(json["results"][0]["path"], "Docs");
        assert_eq!(json["skipped"][0]["position"], 2);
        assert!(
            json["skipped"][0]["reason"]
                .as_str()
                .unwrap_or_default()
                .contains("often")
        );
    }
}
