//! End-to-end tests for the shaper engine against the router
//! simulator.
//!
//! These drive the public facade the way a client would — start a
//! session, apply policies, inspect health, end the session — and
//! verify the simulated router's final state rather than the command
//! strings.

use std::sync::{Arc, Mutex};

use shaper_common::ShaperConfig;
use shaper_testing::{
    already_provisioned_rules, MockShell, RouterSim, MAC_LAPTOP, MAC_PHONE, MAC_ROUTER, MAC_TV,
    SAMPLE_CONFIG_YAML,
};
use shapermgrd::transport::TransportPool;
use shapermgrd::{Mode, Policy, ShaperApi};

fn policy(mode: Mode, devices: &[&str]) -> Policy {
    Policy::new(mode, devices.iter().copied(), "2mbit", "100mbit").unwrap()
}

fn api_over_sim(sim: Arc<Mutex<RouterSim>>) -> ShaperApi {
    let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
    let pool = Arc::new(TransportPool::with_factory(
        &cfg,
        Box::new(move |_| Box::new(MockShell::simulated(Arc::clone(&sim)))),
    ));
    ShaperApi::with_pool(&cfg, pool).unwrap()
}

#[tokio::test]
async fn first_start_provisions_a_fresh_router() {
    let sim = Arc::new(Mutex::new(RouterSim::new()));
    let api = api_over_sim(Arc::clone(&sim));

    let outcome = api.start("living-room").await.unwrap();
    assert!(outcome.provision.complete());

    let sim = sim.lock().unwrap();
    assert!(sim.has_chain("SHAPER_WL"));
    assert!(sim.has_chain("SHAPER_BL"));
    assert!(sim.has_root_qdisc());
    assert_eq!(sim.class_count(), 2);
    assert_eq!(sim.filter_count(), 2);
}

#[tokio::test]
async fn daemon_restart_converges_without_errors() {
    // A router left configured by a previous daemon run answers every
    // create with its object-exists text. Starting against it must
    // succeed with every step already applied.
    let sim = Arc::new(Mutex::new(RouterSim::new()));
    let api = api_over_sim(Arc::clone(&sim));
    api.start("living-room").await.unwrap();

    let api2 = api_over_sim(Arc::clone(&sim));
    let outcome = api2.start("living-room").await.unwrap();
    assert!(outcome.provision.complete());
    assert!(outcome
        .provision
        .steps
        .iter()
        .all(|s| s.verdict == shapermgrd::provision::StepVerdict::AlreadyApplied));
}

#[tokio::test]
async fn scripted_already_provisioned_router_converges() {
    let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
    let pool = Arc::new(TransportPool::with_factory(
        &cfg,
        Box::new(|_| Box::new(MockShell::scripted(already_provisioned_rules()))),
    ));
    let api = ShaperApi::with_pool(&cfg, pool).unwrap();

    let outcome = api.start("office").await.unwrap();
    assert!(outcome.provision.complete());
}

#[tokio::test]
async fn whitelist_then_blacklist_then_none() {
    let sim = Arc::new(Mutex::new(RouterSim::new()));
    let api = api_over_sim(Arc::clone(&sim));
    let session = api.start("living-room").await.unwrap().session_id;

    // Whitelist: the phone and the protected router keep full rate,
    // everyone else is limited.
    let report = api
        .apply_policy(&session, &policy(Mode::Whitelist, &[MAC_PHONE]))
        .await
        .unwrap();
    assert!(report.complete());
    {
        let sim = sim.lock().unwrap();
        let listing = sim.listing("SHAPER_WL");
        assert!(listing.contains(MAC_PHONE));
        assert!(listing.contains(MAC_ROUTER));
        assert!(listing.lines().last().unwrap().contains("0x20"));
        assert!(sim.has_jump("SHAPER_WL"));
        assert!(!sim.has_jump("SHAPER_BL"));
    }

    // Blacklist: the laptop and the TV are limited; the whitelist
    // jump is gone.
    let report = api
        .apply_policy(&session, &policy(Mode::Blacklist, &[MAC_LAPTOP, MAC_TV]))
        .await
        .unwrap();
    assert!(report.complete());
    {
        let sim = sim.lock().unwrap();
        let listing = sim.listing("SHAPER_BL");
        assert!(listing.contains(MAC_LAPTOP));
        assert!(listing.contains(MAC_TV));
        assert!(listing.lines().last().unwrap().contains("0x10"));
        assert!(sim.has_jump("SHAPER_BL"));
        assert!(!sim.has_jump("SHAPER_WL"));
    }

    // None: all shaping structures for device treatment are gone.
    let report = api
        .apply_policy(&session, &policy(Mode::None, &[]))
        .await
        .unwrap();
    assert!(report.complete());
    {
        let sim = sim.lock().unwrap();
        assert!(!sim.has_jump("SHAPER_WL"));
        assert!(!sim.has_jump("SHAPER_BL"));
    }

    api.end(&session).await.unwrap();
}

#[tokio::test]
async fn health_tracks_the_applied_mode() {
    let sim = Arc::new(Mutex::new(RouterSim::new()));
    let api = api_over_sim(Arc::clone(&sim));
    let session = api.start("living-room").await.unwrap().session_id;

    // Freshly provisioned: both jumps present, mode ambiguous.
    let health = api.health(&session).await.unwrap();
    assert!(health.baseline_ok());
    assert_eq!(health.active_mode, None);

    api.apply_policy(&session, &policy(Mode::Blacklist, &[MAC_PHONE]))
        .await
        .unwrap();
    let health = api.health(&session).await.unwrap();
    assert!(health.baseline_ok());
    assert_eq!(health.active_mode, Some(Mode::Blacklist));
    assert!(health.blacklist_chain.ordering_conformant);
    assert_eq!(health.blacklist_chain.rule_count, 2);
}

#[tokio::test]
async fn expired_session_loses_access_but_state_survives() {
    // SAMPLE_CONFIG_YAML uses a 2s TTL.
    let sim = Arc::new(Mutex::new(RouterSim::new()));
    let api = api_over_sim(Arc::clone(&sim));
    let session = api.start("living-room").await.unwrap().session_id;
    api.apply_policy(&session, &policy(Mode::Blacklist, &[MAC_PHONE]))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
    assert_eq!(api.sweep().await, 1);

    // The session can no longer act...
    assert!(api
        .apply_policy(&session, &policy(Mode::None, &[]))
        .await
        .is_err());

    // ...but the router keeps enforcing the last applied policy.
    let sim = sim.lock().unwrap();
    assert!(sim.has_jump("SHAPER_BL"));
    assert!(sim.listing("SHAPER_BL").contains(MAC_PHONE));
}

#[tokio::test]
async fn sessions_on_different_routers_are_independent() {
    let sim_a = Arc::new(Mutex::new(RouterSim::new()));
    let sim_b = Arc::new(Mutex::new(RouterSim::new()));
    let cfg = ShaperConfig::from_yaml(SAMPLE_CONFIG_YAML).unwrap();
    let pool = Arc::new(TransportPool::with_factory(
        &cfg,
        Box::new(move |ep| {
            let sim = if ep.id == "living-room" {
                Arc::clone(&sim_a)
            } else {
                Arc::clone(&sim_b)
            };
            Box::new(MockShell::simulated(sim))
        }),
    ));
    let api = ShaperApi::with_pool(&cfg, pool).unwrap();

    let a = api.start("living-room").await.unwrap().session_id;
    let b = api.start("office").await.unwrap().session_id;

    api.apply_policy(&a, &policy(Mode::Whitelist, &[MAC_PHONE]))
        .await
        .unwrap();
    api.apply_policy(&b, &policy(Mode::Blacklist, &[MAC_LAPTOP]))
        .await
        .unwrap();

    let health_a = api.health(&a).await.unwrap();
    let health_b = api.health(&b).await.unwrap();
    assert_eq!(health_a.active_mode, Some(Mode::Whitelist));
    assert_eq!(health_b.active_mode, Some(Mode::Blacklist));
}
