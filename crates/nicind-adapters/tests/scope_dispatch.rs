use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use nicind_adapters::{adapter_for_origin, AdapterContext};
use nicind_core::{Origin, Period, Scope};
use nicind_storage::{ArtifactStore, FetchMethod, FixtureFetch};
use tempfile::tempdir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn fixture(relative: &str) -> Vec<u8> {
    std::fs::read(workspace_root().join("fixtures").join(relative)).expect("fixture")
}

/// Serves the CONAMI catalog and the SIBOIF March 2024 statement; everything else is a 404.
fn offline_sources() -> FixtureFetch {
    let catalog = fixture("conami/catalog.html");
    let statistics = fixture("siboif/esf_2024_03.json");
    FixtureFetch::new(move |req| {
        if req.url.contains("conami") && req.method == FetchMethod::Get {
            return Some(catalog.clone());
        }
        if req.url.contains("siboif") {
            return match req.query_value("fecha[min]") {
                Some("2024-03-31") => Some(statistics.clone()),
                _ => Some(b"[]".to_vec()),
            };
        }
        None
    })
}

#[tokio::test]
async fn explicit_period_yields_only_that_period() {
    let dir = tempdir().expect("tempdir");
    let ctx = AdapterContext::new(ArtifactStore::new(dir.path()))
        .with_today(NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"));
    let http = offline_sources();
    let scope: Scope = "202403".parse().expect("scope");

    let mut total = 0;
    for origin in Origin::ALL {
        let records = adapter_for_origin(origin)
            .collect(&http, &ctx, scope)
            .await
            .expect("collect");
        assert!(records.iter().all(|r| (r.year, r.month) == (2024, 3)));
        assert!(records.iter().all(|r| r.origin == origin));
        total += records.len();
    }
    // only SIBOIF publishes offline; the BCN downloads 404 and CONAMI's statement POST 404s
    assert_eq!(total, 4);
}

#[tokio::test]
async fn unresolvable_periods_contribute_nothing() {
    let dir = tempdir().expect("tempdir");
    let ctx = AdapterContext::new(ArtifactStore::new(dir.path()));
    let http = offline_sources();
    let period = Period::new(2019, 7).expect("period");

    for origin in Origin::ALL {
        let records = adapter_for_origin(origin)
            .collect(&http, &ctx, Scope::Period(period))
            .await
            .expect("collect");
        assert!(records.is_empty(), "{origin}");
    }
    assert!(http
        .requests()
        .iter()
        .all(|r| r.method == FetchMethod::Get));
}
