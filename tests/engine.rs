//! End-to-end behaviour of the service and engine over the in-memory store.

use std::net::IpAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio_test::assert_ok;

use ratecache::config::{PipelineSettings, Settings};
use ratecache::ratelimit::{
    Code, Descriptor, DescriptorConfig, DistributedRateLimiter, FixedRandom, ManualClock,
    RandomSource, RateLimitConfig, RateLimitRequest, RateLimitRule, RequestContext, SeededRandom,
    TimeUnit, WindowKey,
};
use ratecache::service::RateLimitService;
use ratecache::store::{CounterPools, MemoryStore, PipelineBatcher};

const START: u64 = 1_700_000_000;

struct Engine {
    service: RateLimitService<DistributedRateLimiter>,
    limiter: Arc<DistributedRateLimiter>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn engine_with(settings: Settings, rule: RateLimitRule, random: Arc<dyn RandomSource>) -> Engine {
    engine_over(
        settings,
        vec![DescriptorConfig::new("client_id").limit(rule)],
        random,
    )
}

fn engine_over(
    settings: Settings,
    descriptors: Vec<DescriptorConfig>,
    random: Arc<dyn RandomSource>,
) -> Engine {
    let clock = Arc::new(ManualClock::new(START));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let pools = CounterPools::single(store.clone(), PipelineSettings::default());
    let limiter = Arc::new(DistributedRateLimiter::new(pools, clock.clone(), random, &settings));

    let rules = RateLimitConfig::new().with_domain("edge", descriptors);
    let service = RateLimitService::new(limiter.clone(), Arc::new(rules), &settings).unwrap();

    Engine {
        service,
        limiter,
        store,
        clock,
    }
}

fn engine(settings: Settings, rule: RateLimitRule) -> Engine {
    engine_with(settings, rule, Arc::new(FixedRandom(0)))
}

fn request() -> RateLimitRequest {
    RateLimitRequest::new("edge", vec![Descriptor::new(&[("client_id", "42")])])
}

fn counter_key(engine: &Engine, unit: TimeUnit) -> String {
    use ratecache::ratelimit::Clock;
    WindowKey::derive("edge", &request().descriptors[0], unit, engine.clock.unix_now()).key
}

#[tokio::test]
async fn sequential_requests_exhaust_quota() {
    let e = engine(Settings::default(), RateLimitRule::new(2, TimeUnit::Second));
    let ctx = RequestContext::default();

    let mut verdicts = Vec::new();
    for _ in 0..3 {
        let response = assert_ok!(e.service.should_rate_limit(&ctx, &request()).await);
        let status = &response.statuses[0];
        verdicts.push((response.overall_code, status.limit_remaining));
    }

    assert_eq!(
        verdicts,
        vec![(Code::Ok, 1), (Code::Ok, 0), (Code::OverLimit, 0)]
    );
}

#[tokio::test]
async fn new_window_starts_a_fresh_counter() {
    let e = engine(Settings::default(), RateLimitRule::new(1, TimeUnit::Minute));
    let ctx = RequestContext::default();

    assert_eq!(e.service.should_rate_limit(&ctx, &request()).await.unwrap().overall_code, Code::Ok);
    assert_eq!(
        e.service.should_rate_limit(&ctx, &request()).await.unwrap().overall_code,
        Code::OverLimit
    );

    e.clock.advance(60);
    assert_eq!(e.service.should_rate_limit(&ctx, &request()).await.unwrap().overall_code, Code::Ok);
}

#[tokio::test]
async fn trailing_entries_share_the_matched_rule_counter() {
    let e = engine_over(
        Settings::default(),
        vec![DescriptorConfig::new("service").limit(RateLimitRule::new(1, TimeUnit::Minute))],
        Arc::new(FixedRandom(0)),
    );
    let ctx = RequestContext::default();

    let mut codes = Vec::new();
    for client in ["1", "2", "3"] {
        let request = RateLimitRequest::new(
            "edge",
            vec![Descriptor::new(&[("service", "checkout"), ("client_id", client)])],
        );
        let response = e.service.should_rate_limit(&ctx, &request).await.unwrap();
        codes.push(response.overall_code);
    }

    assert_eq!(codes, vec![Code::Ok, Code::OverLimit, Code::OverLimit]);
    assert_eq!(e.store.len(), 1);

    let key = WindowKey::derive(
        "edge",
        &Descriptor::new(&[("service", "checkout")]),
        TimeUnit::Minute,
        START,
    )
    .key;
    assert_eq!(e.store.get(&key), Some(3));
}

#[tokio::test]
async fn allow_listed_source_is_never_counted() {
    let settings = Settings {
        whitelist_ip_net: "10.0.0.0/8".to_string(),
        ..Settings::default()
    };
    let e = engine(settings, RateLimitRule::new(1, TimeUnit::Second));
    let ctx = RequestContext::default().with_ip("10.1.2.3".parse::<IpAddr>().unwrap());

    for _ in 0..5 {
        let response = e.service.should_rate_limit(&ctx, &request()).await.unwrap();
        assert_eq!(response.overall_code, Code::Ok);
        assert_eq!(response.statuses[0].limit_remaining, 1);
    }

    assert_eq!(e.store.round_trips(), 0);
    assert_eq!(e.limiter.stats().bypassed, 5);
}

#[tokio::test]
async fn deny_list_vetoes_allow_list() {
    let settings = Settings {
        whitelist_ip_net: "10.0.0.0/8".to_string(),
        blacklist_uid: "mallory".to_string(),
        ..Settings::default()
    };
    let e = engine(settings, RateLimitRule::new(1, TimeUnit::Second));
    let ctx = RequestContext::default()
        .with_ip("10.1.2.3".parse::<IpAddr>().unwrap())
        .with_uid("mallory");

    e.service.should_rate_limit(&ctx, &request()).await.unwrap();
    let second = e.service.should_rate_limit(&ctx, &request()).await.unwrap();

    assert_eq!(second.overall_code, Code::OverLimit);
    assert_eq!(e.store.round_trips(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_additive() {
    let e = Arc::new(engine(Settings::default(), RateLimitRule::new(10, TimeUnit::Hour)));

    let tasks: Vec<_> = (0..25)
        .map(|_| {
            let e = e.clone();
            tokio::spawn(async move {
                e.service
                    .should_rate_limit(&RequestContext::default(), &request())
                    .await
                    .map(|response| response.overall_code)
            })
        })
        .collect();

    let codes: Vec<Code> = join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(e.store.get(&counter_key(&e, TimeUnit::Hour)), Some(25));
    assert_eq!(codes.iter().filter(|c| **c == Code::Ok).count(), 10);
    assert_eq!(codes.iter().filter(|c| **c == Code::OverLimit).count(), 15);
}

#[tokio::test]
async fn shadow_rule_counts_but_allows() {
    let e = engine(Settings::default(), RateLimitRule::new(1, TimeUnit::Second).shadow());
    let ctx = RequestContext::default();

    for _ in 0..3 {
        let response = e.service.should_rate_limit(&ctx, &request()).await.unwrap();
        assert_eq!(response.overall_code, Code::Ok);
    }

    let last = e.service.should_rate_limit(&ctx, &request()).await.unwrap();
    assert!(last.statuses[0].shadowed);
    assert_eq!(last.statuses[0].current_count, Some(4));
    assert_eq!(e.store.get(&counter_key(&e, TimeUnit::Second)), Some(4));
}

#[tokio::test]
async fn near_cache_holds_until_window_ends() {
    let settings = Settings {
        local_cache_size_in_bytes: 1 << 20,
        ..Settings::default()
    };
    let e = engine(settings, RateLimitRule::new(2, TimeUnit::Minute));
    let ctx = RequestContext::default();

    for _ in 0..3 {
        e.service.should_rate_limit(&ctx, &request()).await.unwrap();
    }
    assert_eq!(e.store.round_trips(), 3);

    // later requests inside the window are answered locally
    for _ in 0..4 {
        let response = e.service.should_rate_limit(&ctx, &request()).await.unwrap();
        assert_eq!(response.overall_code, Code::OverLimit);
    }
    assert_eq!(e.store.round_trips(), 3);
    assert_eq!(e.limiter.stats().over_limit_with_local_cache, 4);

    e.clock.advance(60);
    let response = e.service.should_rate_limit(&ctx, &request()).await.unwrap();
    assert_eq!(response.overall_code, Code::Ok);
    assert_eq!(e.store.round_trips(), 4);
}

#[tokio::test]
async fn counter_lifetime_stays_within_jitter_bound() {
    let settings = Settings {
        expiration_jitter_max_seconds: 30,
        ..Settings::default()
    };
    let e = engine_with(
        settings,
        RateLimitRule::new(100, TimeUnit::Minute),
        Arc::new(SeededRandom::new(42)),
    );

    e.service
        .should_rate_limit(&RequestContext::default(), &request())
        .await
        .unwrap();

    let expires_at = e.store.expires_at(&counter_key(&e, TimeUnit::Minute)).unwrap();
    assert!(expires_at >= START + 60);
    assert!(expires_at <= START + 60 + 30);

    // later increments in the same window keep the original lifetime
    e.service
        .should_rate_limit(&RequestContext::default(), &request())
        .await
        .unwrap();
    assert_eq!(e.store.expires_at(&counter_key(&e, TimeUnit::Minute)), Some(expires_at));
}

#[tokio::test]
async fn store_outage_follows_failure_mode() {
    let open = engine(Settings::default(), RateLimitRule::new(5, TimeUnit::Second));
    open.store.set_available(false);
    let response = open
        .service
        .should_rate_limit(&RequestContext::default(), &request())
        .await
        .unwrap();
    assert_eq!(response.overall_code, Code::Ok);
    assert_eq!(response.statuses[0].code, Code::Unavailable);

    let settings = Settings {
        failure_mode_deny: true,
        ..Settings::default()
    };
    let closed = engine(settings, RateLimitRule::new(5, TimeUnit::Second));
    closed.store.set_available(false);
    let response = closed
        .service
        .should_rate_limit(&RequestContext::default(), &request())
        .await
        .unwrap();
    assert_eq!(response.overall_code, Code::OverLimit);
    assert_eq!(closed.limiter.stats().store_errors, 1);
}

#[tokio::test]
async fn per_second_rules_use_isolated_pool() {
    let clock = Arc::new(ManualClock::new(START));
    let standard = Arc::new(MemoryStore::new(clock.clone()));
    let per_second = Arc::new(MemoryStore::new(clock.clone()));
    let pools = CounterPools::new(
        PipelineBatcher::spawn(standard.clone(), PipelineSettings::default()),
        Some(PipelineBatcher::spawn(per_second.clone(), PipelineSettings::default())),
    );
    let settings = Settings::default();
    let limiter = Arc::new(DistributedRateLimiter::new(
        pools,
        clock,
        Arc::new(FixedRandom(0)),
        &settings,
    ));
    let rules = RateLimitConfig::new().with_domain(
        "edge",
        vec![
            DescriptorConfig::new("client_id").limit(RateLimitRule::new(5, TimeUnit::Second)),
            DescriptorConfig::new("tenant").limit(RateLimitRule::new(5, TimeUnit::Day)),
        ],
    );
    let service = RateLimitService::new(limiter, Arc::new(rules), &settings).unwrap();

    let request = RateLimitRequest::new(
        "edge",
        vec![
            Descriptor::new(&[("client_id", "42")]),
            Descriptor::new(&[("tenant", "acme")]),
        ],
    );
    let response = service
        .should_rate_limit(&RequestContext::default(), &request)
        .await
        .unwrap();

    assert_eq!(response.statuses.len(), 2);
    assert_eq!(per_second.len(), 1);
    assert_eq!(standard.len(), 1);
}
