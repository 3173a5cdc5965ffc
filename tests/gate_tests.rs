use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use channel_scraper::auth::AuthGate;
use channel_scraper::config::{ApiKeyConfig, QuotaConfig};
use channel_scraper::error::ScrapeError;
use channel_scraper::quota::{QuotaDecision, QuotaReason, QuotaStore};

fn keys() -> Vec<ApiKeyConfig> {
    vec![
        ApiKeyConfig {
            owner: "alice".to_string(),
            key: "alice-secret".to_string(),
        },
        ApiKeyConfig {
            owner: "bob".to_string(),
            key: "bob-secret".to_string(),
        },
    ]
}

fn store(daily_limit: u32, minute_limit: u32) -> Arc<QuotaStore> {
    Arc::new(QuotaStore::new(
        QuotaConfig {
            daily_limit,
            minute_limit,
        },
        keys().into_iter().map(|k| (k.key, k.owner)),
    ))
}

#[test]
fn racing_requests_never_exceed_the_minute_limit() {
    let quota = store(1_000, 10);
    let allowed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(32));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let quota = quota.clone();
            let allowed = allowed.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                if quota.check_and_increment("alice-secret").is_allowed() {
                    allowed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(allowed.load(Ordering::SeqCst), 10);
    let record = quota.snapshot("alice-secret").unwrap();
    assert_eq!(record.minute_count, 10);
    assert_eq!(record.day_count, 10);
}

#[test]
fn exhausting_one_key_leaves_the_other_untouched() {
    let quota = store(1_000, 3);
    for _ in 0..3 {
        assert!(quota.check_and_increment("alice-secret").is_allowed());
    }
    match quota.check_and_increment("alice-secret") {
        QuotaDecision::Denied { reason, retry_after } => {
            assert_eq!(reason, QuotaReason::MinuteLimit);
            assert!(retry_after.as_secs() <= 60);
        }
        other => panic!("expected denial, got {:?}", other),
    }

    assert!(quota.check_and_increment("bob-secret").is_allowed());
    assert_eq!(quota.snapshot("bob-secret").unwrap().minute_count, 1);
}

#[test]
fn gate_admits_until_quota_runs_out() {
    let quota = store(2, 30);
    let gate = AuthGate::new(&keys(), quota.clone());

    let first = gate.authorize(Some("bob-secret")).unwrap();
    assert_eq!(first.owner, "bob");
    assert_eq!(first.remaining_day, 1);
    assert!(gate.authorize(Some("bob-secret")).is_ok());

    match gate.authorize(Some("bob-secret")) {
        Err(ScrapeError::Quota { reason, .. }) => assert_eq!(reason, QuotaReason::DailyLimit),
        other => panic!("expected daily limit, got {:?}", other),
    }
    assert!(gate.authorize(Some("alice-secret")).is_ok());
}

#[test]
fn rejected_keys_cost_no_quota() {
    let quota = store(1_000, 30);
    let gate = AuthGate::new(&keys(), quota.clone());

    for presented in [None, Some(""), Some("alice-secret-but-longer"), Some("ALICE-SECRET")] {
        assert!(matches!(
            gate.authorize(presented),
            Err(ScrapeError::Unauthorized(_))
        ));
    }
    assert_eq!(quota.snapshot("alice-secret").unwrap().day_count, 0);
}

#[test]
fn concurrent_gates_on_distinct_keys() {
    let quota = store(1_000, 5);
    let gate = Arc::new(AuthGate::new(&keys(), quota.clone()));

    let handles: Vec<_> = ["alice-secret", "bob-secret"]
        .into_iter()
        .flat_map(|key| {
            let gate = gate.clone();
            (0..8).map(move |_| {
                let gate = gate.clone();
                thread::spawn(move || gate.authorize(Some(key)).is_ok())
            })
        })
        .collect();
    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(admitted, 10);
    assert_eq!(quota.snapshot("alice-secret").unwrap().minute_count, 5);
    assert_eq!(quota.snapshot("bob-secret").unwrap().minute_count, 5);
}
