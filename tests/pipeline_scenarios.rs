mod common;

use badge_processor::acquisition::FetchError;
use badge_processor::badge::BadgeStatus;
use badge_processor::roster::{ImageFormat, RosterEntry};
use common::{portrait_png, BadgeEnv, MockServer};
use std::collections::HashMap;
use std::time::Duration;

fn roster() -> Vec<RosterEntry> {
    vec![
        RosterEntry::new("john", "T001", "SE", 1).expect("john"),
        RosterEntry::new("mai", "7", "PM", 1).expect("mai"),
        RosterEntry::new("lan", "42", "QA", 2).expect("lan"),
    ]
}

fn route(entry: &RosterEntry) -> String {
    format!("/img/{}.png", entry.fetch_key().expect("numeric id"))
}

#[test]
fn missing_sources_are_downloaded_and_every_badge_is_built() {
    let env = BadgeEnv::new();
    let roster = roster();
    env.place_source(&roster[0].filename(ImageFormat::Png), &portrait_png(120, 160));

    let routes = HashMap::from([
        (route(&roster[1]), (200, portrait_png(200, 260))),
        (route(&roster[2]), (200, portrait_png(90, 90))),
    ]);
    let server = MockServer::start(routes);

    let report = env.orchestrator(&server.base_url).run(&roster, &env.spec());

    let stats = &report.acquisition;
    assert_eq!(stats.total, 3);
    assert_eq!(stats.missing, 2);
    assert_eq!(stats.downloaded, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.already_available, 1);

    assert_eq!(report.results.len(), 3);
    for (result, entry) in report.results.iter().zip(&roster) {
        assert_eq!(&result.roster_entry, entry);
        assert_ne!(result.status, BadgeStatus::Failed, "{:?}", result.error_reason);
        let output = result.output_path.as_ref().expect("badge path");
        let badge = image::open(output).expect("badge decodes");
        assert_eq!((badge.width(), badge.height()), (300, 450));
    }
    assert_eq!(env.output_files().len(), 3);

    // The locally present image never reaches the server
    assert!(!server.requested_paths().contains(&route(&roster[0])));
    assert!(roster.iter().all(|e| env.source_exists(&e.filename(ImageFormat::Png))));
}

#[test]
fn not_found_fails_only_that_entry() {
    let env = BadgeEnv::new();
    let roster = roster();
    env.place_source(&roster[0].filename(ImageFormat::Png), &portrait_png(120, 160));

    // Only mai is served; lan answers 404
    let routes = HashMap::from([(route(&roster[1]), (200, portrait_png(200, 260)))]);
    let server = MockServer::start(routes);

    let report = env.orchestrator(&server.base_url).run(&roster, &env.spec());

    assert_eq!(report.acquisition.downloaded, 1);
    assert_eq!(report.acquisition.failed, 1);
    let lan_file = roster[2].filename(ImageFormat::Png);
    let failure = report.acquisition.failures.get(&lan_file).expect("failure recorded");
    assert_eq!(failure.reason_code(), FetchError::NotFound.reason_code());
    assert!(!env.source_exists(&lan_file));

    assert_eq!(report.results[2].status, BadgeStatus::Failed);
    assert!(report.results[2]
        .error_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("image unavailable"));
    assert!(!report.results[0].is_failed());
    assert!(!report.results[1].is_failed());
    assert_eq!(report.failed().count(), 1);
}

#[test]
fn forbidden_portrait_fails_with_its_reason_and_leaves_no_file() {
    let env = BadgeEnv::new();
    let roster = roster();
    let routes = HashMap::from([
        (route(&roster[0]), (403, b"forbidden".to_vec())),
        (route(&roster[1]), (200, portrait_png(100, 140))),
        (route(&roster[2]), (200, portrait_png(100, 140))),
    ]);
    let server = MockServer::start(routes);

    let report = env.orchestrator(&server.base_url).run(&roster, &env.spec());

    let john_file = roster[0].filename(ImageFormat::Png);
    let failure = report.acquisition.failures.get(&john_file).expect("failure recorded");
    assert_eq!(failure.reason_code(), "FORBIDDEN");
    assert_eq!(report.acquisition.downloaded, 2);
    assert!(!env.source_exists(&john_file));
    assert!(!env.source_exists(&format!("{}.part", john_file)));

    assert!(report.results[0].is_failed());
    assert!(report.results[0]
        .error_reason
        .as_deref()
        .unwrap_or_default()
        .contains("forbidden"));
    assert_eq!(report.failed().count(), 1);
}

#[test]
fn slow_server_times_out_without_partial_files() {
    let env = BadgeEnv::new();
    let roster = roster();
    let routes = HashMap::from([
        (route(&roster[0]), (200, portrait_png(100, 140))),
        (route(&roster[1]), (200, portrait_png(100, 140))),
    ]);
    let delays = HashMap::from([(route(&roster[0]), Duration::from_secs(3))]);
    let server = MockServer::start_with_delays(routes, delays);

    let report = env
        .orchestrator_with_timeout(&server.base_url, Duration::from_millis(300))
        .run(&roster[..2], &env.spec());

    let john_file = roster[0].filename(ImageFormat::Png);
    let failure = report.acquisition.failures.get(&john_file).expect("failure recorded");
    assert_eq!(failure.reason_code(), "TIMEOUT");
    assert!(!env.source_exists(&john_file));
    assert!(!env.source_exists(&format!("{}.part", john_file)));

    // The fast route is unaffected by the stalled one
    assert_eq!(report.acquisition.downloaded, 1);
    assert!(!report.results[1].is_failed());
    assert!(report.results[0].is_failed());
    assert!(report.elapsed_secs < 3.0);
}

#[test]
fn corrupt_local_image_fails_at_composition_without_download() {
    let env = BadgeEnv::new();
    let roster = roster();

    let mut truncated = portrait_png(120, 160);
    truncated.truncate(40);
    for entry in &roster {
        env.place_source(&entry.filename(ImageFormat::Png), &truncated);
    }
    let server = MockServer::start(HashMap::new());

    let report = env.orchestrator(&server.base_url).run(&roster, &env.spec());

    assert_eq!(report.acquisition.already_available, 3);
    assert_eq!(report.acquisition.missing, 0);
    assert_eq!(server.hits(), 0);
    for result in &report.results {
        assert_eq!(result.status, BadgeStatus::Failed);
        assert!(result
            .error_reason
            .as_deref()
            .unwrap_or_default()
            .contains("unreadable source"));
    }
    assert!(env.output_files().is_empty());
}

#[test]
fn second_run_downloads_nothing() {
    let env = BadgeEnv::new();
    let roster = roster();
    let routes: HashMap<_, _> = roster
        .iter()
        .map(|e| (route(e), (200, portrait_png(100, 140))))
        .collect();
    let server = MockServer::start(routes);
    let orchestrator = env.orchestrator(&server.base_url);

    let first = orchestrator.run(&roster, &env.spec());
    assert_eq!(first.acquisition.downloaded, 3);
    let hits_after_first = server.hits();
    assert_eq!(hits_after_first, 3);

    let second = orchestrator.run(&roster, &env.spec());
    assert_eq!(second.acquisition.downloaded, 0);
    assert_eq!(second.acquisition.already_available, 3);
    assert_eq!(server.hits(), hits_after_first);
    assert_eq!(second.count(BadgeStatus::Failed), 0);
}

#[test]
fn shared_fetch_key_is_requested_once() {
    let env = BadgeEnv::new();
    // Same person on two badges: one download, both source files present
    let roster = vec![
        RosterEntry::new("john", "T001", "SE", 1).expect("john"),
        RosterEntry::new("john", "T001", "SE", 2).expect("john again"),
        RosterEntry::new("mai", "7", "PM", 1).expect("mai"),
    ];
    let routes: HashMap<_, _> = roster
        .iter()
        .map(|e| (route(e), (200, portrait_png(100, 140))))
        .collect();
    let server = MockServer::start(routes);

    let report = env.orchestrator(&server.base_url).run(&roster, &env.spec());

    let mut paths = server.requested_paths();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), server.hits());
    assert_eq!(server.hits(), 2);

    assert_eq!(report.acquisition.downloaded, 3);
    assert!(roster.iter().all(|e| env.source_exists(&e.filename(ImageFormat::Png))));
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.count(BadgeStatus::Failed), 0);
}

#[test]
fn report_lists_every_entry_even_when_server_is_down() {
    let env = BadgeEnv::new();
    let roster = roster();

    // Nothing listens on port 9
    let report = env.orchestrator("http://127.0.0.1:9/img").run(&roster, &env.spec());

    assert_eq!(report.results.len(), roster.len());
    assert_eq!(report.acquisition.failed, 3);
    assert!(report.results.iter().all(|r| r.is_failed()));

    let json = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(json["acquisition"]["failed"], 3);
    assert_eq!(json["results"][0]["status"], "FAILED");
}
