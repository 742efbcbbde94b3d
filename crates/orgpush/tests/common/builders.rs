//! Builders for engines, catalog data and schedule requests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orgpush::db::catalog_repo::{self, PackageRow, PackageVersionRow};
use orgpush::db::item_repo::{ItemFilter, ItemView};
use orgpush::db::job_repo::{JobFilter, JobView};
use orgpush::db::query::{ItemSort, JobSort};
use orgpush::db::SortDir;
use orgpush::orchestrator::{PushTarget, ScheduleRequest};
use orgpush::{Database, EngineConfig, MonitorLoop, Orchestrator, UpgradeEventBus};

use super::fake_org::{FakeConnector, FakeOrg};

pub const CORE_PACKAGE_ORG: &str = "00DP00000000001AAA";
pub const ADDON_PACKAGE_ORG: &str = "00DP00000000002AAA";
pub const CORE_PACKAGE: &str = "033000000000001AAA";
pub const ADDON_PACKAGE: &str = "033000000000002AAA";
pub const CORE_V1: &str = "04t000000000011AAA";
pub const CORE_V2: &str = "04t000000000012AAA";
pub const ADDON_V2: &str = "04t000000000022AAA";

pub const SUBSCRIBERS: [&str; 3] = [
    "00D000000000001AAA",
    "00D000000000002AAA",
    "00D000000000003AAA",
];

/// An orchestrator over an in-memory store and fake package orgs.
pub struct TestEngine {
    pub db: Database,
    pub connector: Arc<FakeConnector>,
    pub events: UpgradeEventBus,
    pub orchestrator: Orchestrator,
}

impl TestEngine {
    /// Engine with the activation policy enforced.
    pub fn new() -> Self {
        Self::with_policy(true)
    }

    pub fn with_policy(enforce_activation_policy: bool) -> Self {
        let db = Database::open_in_memory().expect("in-memory database");
        let connector = Arc::new(FakeConnector::default());
        connector.add_org(CORE_PACKAGE_ORG);
        connector.add_org(ADDON_PACKAGE_ORG);
        let events = UpgradeEventBus::new(1024);
        let config = EngineConfig {
            enforce_activation_policy,
            ..Default::default()
        };
        let orchestrator =
            Orchestrator::new(db.clone(), connector.clone(), events.clone(), &config);
        seed_catalog(&db);
        Self {
            db,
            connector,
            events,
            orchestrator,
        }
    }

    pub fn core_org(&self) -> Arc<FakeOrg> {
        self.connector.org(CORE_PACKAGE_ORG)
    }

    pub fn addon_org(&self) -> Arc<FakeOrg> {
        self.connector.org(ADDON_PACKAGE_ORG)
    }

    pub fn monitor(&self) -> MonitorLoop {
        MonitorLoop::new(self.orchestrator.clone(), Duration::from_secs(60))
    }

    pub fn items(&self, upgrade_id: i64) -> Vec<ItemView> {
        self.orchestrator
            .list_items(&ItemFilter::Upgrade(upgrade_id), ItemSort::Activation, SortDir::Asc)
            .unwrap()
    }

    pub fn jobs(&self, upgrade_id: i64) -> Vec<JobView> {
        self.orchestrator
            .list_jobs(&JobFilter::by_upgrade(upgrade_id), JobSort::Id, SortDir::Asc)
            .unwrap()
    }

    pub fn item_jobs(&self, item_id: i64) -> Vec<JobView> {
        self.orchestrator
            .list_jobs(&JobFilter::by_item(item_id), JobSort::Id, SortDir::Asc)
            .unwrap()
    }
}

/// Core on tier 1, Addon on tier 2, each with an installed v1 and a new v2.
pub fn seed_catalog(db: &Database) {
    for (sfid, name, package_org, tier) in [
        (CORE_PACKAGE, "Core", CORE_PACKAGE_ORG, 1),
        (ADDON_PACKAGE, "Addon", ADDON_PACKAGE_ORG, 2),
    ] {
        catalog_repo::upsert_package(
            db,
            &PackageRow {
                sfid: sfid.to_string(),
                name: name.to_string(),
                package_org_id: package_org.to_string(),
                dependency_tier: tier,
            },
        )
        .unwrap();
    }

    for (version_id, package_id, number, sort) in [
        (CORE_V1, CORE_PACKAGE, "1.0", 1_000_000),
        (CORE_V2, CORE_PACKAGE, "2.0", 2_000_000),
        ("04t000000000021AAA", ADDON_PACKAGE, "1.0", 1_000_000),
        (ADDON_V2, ADDON_PACKAGE, "2.0", 2_000_000),
    ] {
        catalog_repo::upsert_package_version(
            db,
            &PackageVersionRow {
                version_id: version_id.to_string(),
                package_id: package_id.to_string(),
                version_number: number.to_string(),
                version_sort: sort,
            },
        )
        .unwrap();
    }

    for org in SUBSCRIBERS {
        catalog_repo::upsert_installed_version(
            db,
            org,
            CORE_PACKAGE,
            CORE_V1,
            chrono::Utc::now(),
        )
        .unwrap();
    }
}

/// Adds a package with a single version to the catalog.
pub fn seed_package(
    db: &Database,
    sfid: &str,
    name: &str,
    package_org_id: &str,
    dependency_tier: i64,
    version_id: &str,
) {
    catalog_repo::upsert_package(
        db,
        &PackageRow {
            sfid: sfid.to_string(),
            name: name.to_string(),
            package_org_id: package_org_id.to_string(),
            dependency_tier,
        },
    )
    .unwrap();
    catalog_repo::upsert_package_version(
        db,
        &PackageVersionRow {
            version_id: version_id.to_string(),
            package_id: sfid.to_string(),
            version_number: "1.0".to_string(),
            version_sort: 1_000_000,
        },
    )
    .unwrap();
}

/// Builder for `ScheduleRequest`.
pub struct ScheduleBuilder {
    request: ScheduleRequest,
}

impl ScheduleBuilder {
    pub fn new() -> Self {
        Self {
            request: ScheduleRequest {
                created_by: Some("alice".to_string()),
                description: Some("Quarterly release".to_string()),
                ..Default::default()
            },
        }
    }

    pub fn created_by(mut self, user: Option<&str>) -> Self {
        self.request.created_by = user.map(str::to_string);
        self
    }

    pub fn blacklist(mut self, org_id: &str) -> Self {
        self.request.blacklist.push(org_id.to_string());
        self
    }

    pub fn target(mut self, package_org_id: &str, version_id: &str, org_ids: &[&str]) -> Self {
        self.request.targets.push(PushTarget {
            package_org_id: package_org_id.to_string(),
            version_id: version_id.to_string(),
            org_ids: org_ids.iter().map(|o| o.to_string()).collect(),
        });
        self
    }

    /// Core v2 and Addon v2 to all subscribers.
    pub fn two_tiers(self) -> Self {
        self.target(CORE_PACKAGE_ORG, CORE_V2, &SUBSCRIBERS)
            .target(ADDON_PACKAGE_ORG, ADDON_V2, &SUBSCRIBERS)
    }

    pub fn build(self) -> ScheduleRequest {
        self.request
    }
}
